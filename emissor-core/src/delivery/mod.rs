//! Delivery of replication operations to receivers.
//!
//! Each operation maps onto one endpoint of the receiver's REST namespace:
//!
//! | Operation | Method | Path |
//! |---|---|---|
//! | send | POST | `wp-json/post-receptor/v1/receive` |
//! | update status | POST | `wp-json/post-receptor/v1/update-status` |
//! | delete | POST | `wp-json/post-receptor/v1/delete` |
//! | test connection | GET | `wp-json/post-receptor/v1/check-token` |
//!
//! Only `send` is retried. Every operation returns a
//! [`DeliveryResult`](crate::types::DeliveryResult) and never an error.

mod client;
mod retry;

pub use client::DeliveryClient;
pub use retry::{backoff_delay, RetryPolicy};

/// REST namespace every receiver exposes.
pub const API_NAMESPACE: &str = "wp-json/post-receptor/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Send,
    UpdateStatus,
    Delete,
    TestConnection,
}

impl Operation {
    pub fn path(&self) -> &'static str {
        match self {
            Operation::Send => "receive",
            Operation::UpdateStatus => "update-status",
            Operation::Delete => "delete",
            Operation::TestConnection => "check-token",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operation::Send => "send",
            Operation::UpdateStatus => "update_status",
            Operation::Delete => "delete",
            Operation::TestConnection => "test_connection",
        }
    }
}

/// Full endpoint URL for `operation` on a receiver base URL.
pub fn endpoint(base_url: &str, operation: Operation) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim().trim_end_matches('/'),
        API_NAMESPACE,
        operation.path()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalises_trailing_slash() {
        assert_eq!(
            endpoint("https://a.example/", Operation::Send),
            "https://a.example/wp-json/post-receptor/v1/receive"
        );
        assert_eq!(
            endpoint("https://a.example/blog", Operation::TestConnection),
            "https://a.example/blog/wp-json/post-receptor/v1/check-token"
        );
    }
}
