//! HTTP client for receiver endpoints.

use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::json;

use crate::activity::ActivityLog;
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::types::{
    DeleteRequest, DeliveryResult, DeliveryStatus, JobAction, PostPayload, Receiver, StatusUpdate,
};

use super::retry::RetryPolicy;
use super::{endpoint, Operation};

const INVALID_TOKEN_MESSAGE: &str = "invalid token or connection failure";
const CONNECTED_MESSAGE: &str = "connected";

/// HTTP client for the receiver REST namespace.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct DeliveryClient {
    http_client: reqwest::Client,
    timeout: Duration,
    test_timeout: Duration,
    retry: RetryPolicy,
    activity: Option<ActivityLog>,
}

impl DeliveryClient {
    /// Create a client from configuration.
    ///
    /// Redirects are not followed: a receiver answering with a redirect is
    /// reported as a failed delivery.
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        config.validate()?;

        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            timeout: config.timeout(),
            test_timeout: config.test_timeout(),
            retry: RetryPolicy::from_config(config),
            activity: None,
        })
    }

    /// Record every delivery outcome in the activity log as well.
    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Deliver a post snapshot, retrying with exponential backoff.
    pub async fn send(&self, post: &PostPayload, receiver: &Receiver) -> DeliveryResult {
        let mut attempt = 1;
        loop {
            let mut result = self
                .post_once(Operation::Send, post, receiver, post.post_id, attempt)
                .await;
            result.attempts = attempt;

            if result.is_ok() || self.retry.is_final_attempt(attempt) {
                return result;
            }

            let delay = self.retry.delay_after(attempt);
            tracing::debug!(
                receiver_url = %receiver.url,
                post_id = post.post_id,
                attempt,
                max_attempts = self.retry.max_attempts,
                ?delay,
                "Retrying send"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Propagate a post status change. One attempt.
    pub async fn update_status(&self, update: &StatusUpdate, receiver: &Receiver) -> DeliveryResult {
        self.post_once(Operation::UpdateStatus, update, receiver, update.post_id, 1)
            .await
    }

    /// Propagate a post deletion. One attempt.
    pub async fn delete(&self, request: &DeleteRequest, receiver: &Receiver) -> DeliveryResult {
        self.post_once(Operation::Delete, request, receiver, request.post_id, 1)
            .await
    }

    /// Check that the receiver is reachable and accepts the token.
    ///
    /// Requires a 2xx answer whose JSON body carries `"success": true`.
    pub async fn test_connection(&self, receiver: &Receiver) -> DeliveryResult {
        let url = endpoint(&receiver.url, Operation::TestConnection);
        let request = self.authorized(self.http_client.get(&url), receiver);

        let result = match request.timeout(self.test_timeout).send().await {
            Ok(response) => {
                let status = response.status();
                let code = status.as_u16();
                let confirmed = status.is_success()
                    && response
                        .json::<serde_json::Value>()
                        .await
                        .map(|body| body.get("success") == Some(&serde_json::Value::Bool(true)))
                        .unwrap_or(false);

                if confirmed {
                    outcome(receiver, DeliveryStatus::Ok, CONNECTED_MESSAGE.to_string(), Some(code))
                } else if status.is_success() {
                    outcome(
                        receiver,
                        DeliveryStatus::Fail,
                        INVALID_TOKEN_MESSAGE.to_string(),
                        Some(code),
                    )
                } else {
                    outcome(receiver, DeliveryStatus::Fail, response_message(code), Some(code))
                }
            }
            Err(e) => outcome(receiver, DeliveryStatus::Fail, transport_message(&e), None),
        };

        self.record(Operation::TestConnection, receiver, None, &result, true);
        result
    }

    /// Route a queued action to its operation.
    pub async fn dispatch(&self, action: &JobAction, receiver: &Receiver) -> DeliveryResult {
        match action {
            JobAction::Send(post) => self.send(post, receiver).await,
            JobAction::UpdateStatus(update) => self.update_status(update, receiver).await,
            JobAction::Delete(request) => self.delete(request, receiver).await,
        }
    }

    async fn post_once<T: Serialize + ?Sized>(
        &self,
        operation: Operation,
        body: &T,
        receiver: &Receiver,
        post_id: i64,
        attempt: u32,
    ) -> DeliveryResult {
        let url = endpoint(&receiver.url, operation);
        let request = self
            .authorized(self.http_client.post(&url), receiver)
            .json(body)
            .timeout(self.timeout);

        let result = match request.send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let status = if response.status().is_success() {
                    DeliveryStatus::Ok
                } else {
                    DeliveryStatus::Fail
                };
                outcome(receiver, status, response_message(code), Some(code))
            }
            Err(e) => outcome(receiver, DeliveryStatus::Fail, transport_message(&e), None),
        };

        let is_final = result.is_ok()
            || operation != Operation::Send
            || self.retry.is_final_attempt(attempt);
        self.record(operation, receiver, Some((post_id, attempt)), &result, is_final);
        result
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        receiver: &Receiver,
    ) -> reqwest::RequestBuilder {
        let token = receiver.auth_token.as_deref().filter(|t| !t.is_empty());
        match token.map(|t| HeaderValue::from_str(&format!("Bearer {}", t))) {
            Some(Ok(mut value)) => {
                value.set_sensitive(true);
                request.header(AUTHORIZATION, value)
            }
            Some(Err(_)) => {
                tracing::warn!(
                    receiver_url = %receiver.url,
                    "Token contains characters not allowed in a header; sending without it"
                );
                request
            }
            None => request,
        }
    }

    fn record(
        &self,
        operation: Operation,
        receiver: &Receiver,
        attempt: Option<(i64, u32)>,
        result: &DeliveryResult,
        is_final: bool,
    ) {
        let mut context = json!({
            "operation": operation.label(),
            "receiver_url": receiver.url,
            "response_code": result.response_code,
            "message": result.message,
        });
        if let Some((post_id, attempt)) = attempt {
            context["post_id"] = json!(post_id);
            context["attempt"] = json!(attempt);
        }

        let message = match (result.status, is_final) {
            (DeliveryStatus::Ok, _) => format!("{} succeeded", operation.label()),
            (DeliveryStatus::Fail, false) => format!("{} attempt failed", operation.label()),
            (DeliveryStatus::Fail, true) => format!("{} failed", operation.label()),
        };

        match &self.activity {
            Some(activity) => match (result.status, is_final) {
                (DeliveryStatus::Ok, _) => activity.info(&message, context),
                (DeliveryStatus::Fail, false) => activity.warning(&message, context),
                (DeliveryStatus::Fail, true) => activity.error(&message, context),
            },
            None => match result.status {
                DeliveryStatus::Ok => tracing::info!(%context, "{message}"),
                DeliveryStatus::Fail => tracing::warn!(%context, "{message}"),
            },
        }
    }
}

fn outcome(
    receiver: &Receiver,
    status: DeliveryStatus,
    message: String,
    response_code: Option<u16>,
) -> DeliveryResult {
    DeliveryResult {
        receiver_url: receiver.url.clone(),
        status,
        message,
        response_code,
        attempts: 1,
    }
}

fn response_message(code: u16) -> String {
    format!("response code: {}", code)
}

fn transport_message(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("request timed out: {}", error)
    } else {
        error.to_string()
    }
}
