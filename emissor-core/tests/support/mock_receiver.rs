//! Mock receiver site for delivery tests
#![allow(dead_code)] // Not every test file uses every helper
//!
//! A tiny HTTP/1.1 server on a random loopback port that answers each request
//! with the next scripted response (falling back to a default once the script
//! is used up) and records what it received.
//!
//! ```rust,no_run
//! # async fn example() {
//! let receiver = MockReceiver::builder()
//!     .respond(500, "{}")
//!     .respond(200, r#"{"success":true}"#)
//!     .build()
//!     .await;
//! let url = receiver.url();
//! # }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request as the receiver saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
struct Reply {
    status: u16,
    body: String,
}

struct State {
    script: VecDeque<Reply>,
    fallback: Reply,
    /// Read requests but never answer them
    silent: bool,
    requests: Vec<RecordedRequest>,
}

pub struct MockReceiver {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

pub struct MockReceiverBuilder {
    script: VecDeque<Reply>,
    fallback: Reply,
    silent: bool,
}

impl MockReceiver {
    pub fn builder() -> MockReceiverBuilder {
        MockReceiverBuilder {
            script: VecDeque::new(),
            fallback: Reply {
                status: 200,
                body: r#"{"success":true}"#.to_string(),
            },
            silent: false,
        }
    }

    /// Receiver that answers every request with `status`
    pub async fn always(status: u16) -> Self {
        Self::builder().otherwise(status, "{}").build().await
    }

    /// Receiver that accepts connections and requests but never responds
    pub async fn silent() -> Self {
        let mut builder = Self::builder();
        builder.silent = true;
        builder.build().await
    }

    /// Base URL to register as the receiver site
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    async fn serve(listener: TcpListener, state: Arc<Mutex<State>>) {
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _ = Self::handle(stream, state).await;
            });
        }
    }

    async fn handle(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        let mut authorization = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                match name.to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.parse().unwrap_or(0),
                    "authorization" => authorization = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let reply = {
            let mut state = state.lock().unwrap();
            state.requests.push(RecordedRequest {
                method,
                path,
                authorization,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
            if state.silent {
                None
            } else {
                let fallback = state.fallback.clone();
                Some(state.script.pop_front().unwrap_or(fallback))
            }
        };
        let Some(reply) = reply else {
            // Hold the connection open until the client gives up.
            std::future::pending::<()>().await;
            return Ok(());
        };

        let response = format!(
            "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reply.status,
            reply.body.len(),
            reply.body
        );
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockReceiverBuilder {
    /// Queue a response for the next unanswered request
    #[must_use]
    pub fn respond(mut self, status: u16, body: impl Into<String>) -> Self {
        self.script.push_back(Reply {
            status,
            body: body.into(),
        });
        self
    }

    /// Response used once the script is exhausted
    #[must_use]
    pub fn otherwise(mut self, status: u16, body: impl Into<String>) -> Self {
        self.fallback = Reply {
            status,
            body: body.into(),
        };
        self
    }

    pub async fn build(self) -> MockReceiver {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock receiver");
        let addr = listener.local_addr().expect("mock receiver has no address");
        let state = Arc::new(Mutex::new(State {
            script: self.script,
            fallback: self.fallback,
            silent: self.silent,
            requests: Vec::new(),
        }));
        let task = tokio::spawn(MockReceiver::serve(listener, Arc::clone(&state)));

        MockReceiver { addr, state, task }
    }
}
