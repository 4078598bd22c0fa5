//! Core domain types for emissor
//!
//! These types describe the outbound replication pipeline: the receivers
//! content is pushed to, the jobs waiting in the durable queue, and the
//! delivery outcomes folded into reports.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Receiver** | A remote site configured to accept replicated posts |
//! | **Job** | One queued replication of a post event towards a list of receivers |
//! | **Delivery attempt** | One HTTP call to one receiver for one operation |
//! | **Report** | The aggregate outcome of one job across all its receivers |
//! | **Backoff** | The growing delay inserted between retried attempts |
//!
//! ### Tokens
//!
//! A [`Receiver`] carries its bearer token in plaintext, but only in memory
//! after the registry decrypted it. A [`ReceiverSnapshot`] (what the queue
//! stores) carries the ciphertext exactly as the registry stored it; the
//! processor decrypts it right before dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================
// Receivers
// ============================================

/// Whether a receiver takes part in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverStatus {
    #[default]
    Active,
    Inactive,
}

impl ReceiverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiverStatus::Active => "active",
            ReceiverStatus::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for ReceiverStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReceiverStatus::Active),
            "inactive" => Ok(ReceiverStatus::Inactive),
            _ => Err(format!("unknown receiver status: {}", s)),
        }
    }
}

/// A configured receiver with its token decrypted.
#[derive(Clone, PartialEq)]
pub struct Receiver {
    pub id: i64,
    pub name: String,
    /// Base URL of the receiving site
    pub url: String,
    /// Plaintext bearer token; `None` means requests go out unauthenticated
    pub auth_token: Option<String>,
    pub status: ReceiverStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Receiver data submitted by a configuration action.
///
/// On update, an `auth_token` of `None` (or an empty string) keeps the token
/// already stored for the receiver.
#[derive(Debug, Clone, Default)]
pub struct ReceiverInput {
    pub name: String,
    pub url: String,
    pub auth_token: Option<String>,
    pub status: ReceiverStatus,
}

/// Receiver as captured in a queued job at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSnapshot {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Token in its stored (encrypted) form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_token: Option<String>,
}

// ============================================
// Job payloads
// ============================================

/// Snapshot of a post as delivered to the `receive` endpoint.
///
/// Field names follow the receiver's wire format. Unknown fields are kept
/// in `extra` so a newer producer never loses data through this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PostPayload {
    #[serde(rename = "ID")]
    pub post_id: i64,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    pub slug: String,
    pub status: String,
    #[serde(default)]
    pub categories: Vec<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yoast_metadesc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elementor: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of the `update-status` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "ID")]
    pub post_id: i64,
    pub status: String,
}

/// Body of the `delete` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(rename = "ID")]
    pub post_id: i64,
    pub action: String,
}

impl DeleteRequest {
    pub fn new(post_id: i64) -> Self {
        Self {
            post_id,
            action: "delete".to_string(),
        }
    }
}

/// The operation a job replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobAction {
    Send(PostPayload),
    UpdateStatus(StatusUpdate),
    Delete(DeleteRequest),
}

impl JobAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            JobAction::Send(_) => ActionKind::Send,
            JobAction::UpdateStatus(_) => ActionKind::UpdateStatus,
            JobAction::Delete(_) => ActionKind::Delete,
        }
    }

    pub fn post_id(&self) -> i64 {
        match self {
            JobAction::Send(post) => post.post_id,
            JobAction::UpdateStatus(update) => update.post_id,
            JobAction::Delete(delete) => delete.post_id,
        }
    }
}

/// Discriminant of [`JobAction`], stored in its own queue column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Send,
    UpdateStatus,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Send => "send",
            ActionKind::UpdateStatus => "update_status",
            ActionKind::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(ActionKind::Send),
            "update_status" | "update-status" => Ok(ActionKind::UpdateStatus),
            "delete" => Ok(ActionKind::Delete),
            _ => Err(format!("unknown action: {}", s)),
        }
    }
}

// ============================================
// Queue
// ============================================

/// Lifecycle of a queued job
///
/// `Processing` is the claim marker: a cycle moved the job out of `Pending`
/// and owns it until it is marked `Completed`. `Failed` is terminal and only
/// used for rows whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown job status: {}", s)),
        }
    }
}

/// A decoded queue row
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationJob {
    pub id: i64,
    pub post_id: i64,
    pub action: JobAction,
    pub receivers: Vec<ReceiverSnapshot>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Job counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub failed: i64,
    pub total: i64,
}

// ============================================
// Delivery outcomes
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Ok,
    Fail,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Ok => "ok",
            DeliveryStatus::Fail => "fail",
        }
    }
}

/// Outcome of one operation against one receiver, after all its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub receiver_url: String,
    pub status: DeliveryStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default = "one")]
    pub attempts: u32,
}

fn one() -> u32 {
    1
}

impl DeliveryResult {
    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}

/// Aggregate counts of a report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    /// Percentage in `[0, 100]`, rounded to two decimals
    pub success_rate: f64,
}

impl ReportSummary {
    pub fn from_results(results: &[DeliveryResult]) -> Self {
        let total = results.len();
        let success = results.iter().filter(|r| r.is_ok()).count();
        Self {
            total,
            success,
            errors: total - success,
            success_rate: percentage(success, total),
        }
    }
}

/// `part / whole * 100` rounded to two decimals, `0.0` when `whole` is zero.
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let rate = part as f64 / whole as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Delivery report for one processed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub post_id: i64,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<DeliveryResult>,
    pub summary: ReportSummary,
}

impl Report {
    pub fn new(post_id: i64, results: Vec<DeliveryResult>) -> Self {
        let summary = ReportSummary::from_results(&results);
        Self {
            post_id,
            timestamp: Utc::now(),
            results,
            summary,
        }
    }
}

/// Totals across every stored report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GeneralStats {
    pub total_reports: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub success_rate: f64,
}

// ============================================
// Activity log
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

/// A persisted activity log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: DeliveryStatus) -> DeliveryResult {
        DeliveryResult {
            receiver_url: "https://example.com".to_string(),
            status,
            message: String::new(),
            response_code: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_summary_of_empty_results_has_zero_rate() {
        let summary = ReportSummary::from_results(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn test_summary_rounds_to_two_decimals() {
        let results = vec![
            result(DeliveryStatus::Ok),
            result(DeliveryStatus::Fail),
            result(DeliveryStatus::Fail),
        ];
        let summary = ReportSummary::from_results(&results);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.success_rate, 33.33);
    }

    #[test]
    fn test_success_rate_stays_within_bounds() {
        for total in 0..20usize {
            for success in 0..=total {
                let rate = percentage(success, total);
                assert!((0.0..=100.0).contains(&rate), "{success}/{total} gave {rate}");
            }
        }
    }

    #[test]
    fn test_job_action_wire_shape() {
        let action = JobAction::Delete(DeleteRequest::new(42));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["data"]["ID"], 42);
        assert_eq!(json["data"]["action"], "delete");
        assert_eq!(action.kind(), ActionKind::Delete);
        assert_eq!(action.post_id(), 42);
    }

    #[test]
    fn test_post_payload_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "ID": 7,
            "title": "Hello",
            "content": "Body",
            "slug": "hello",
            "status": "publish",
            "custom_meta": {"a": 1}
        });
        let post: PostPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(post.post_id, 7);
        assert_eq!(post.extra["custom_meta"]["a"], 1);

        let back = serde_json::to_value(&post).unwrap();
        assert_eq!(back["custom_meta"]["a"], 1);
        assert!(back.get("focus_keyword").is_none());
    }

    #[test]
    fn test_receiver_debug_redacts_token() {
        let receiver = Receiver {
            id: 1,
            name: "site".to_string(),
            url: "https://example.com".to_string(),
            auth_token: Some("super-secret-token".to_string()),
            status: ReceiverStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let rendered = format!("{:?}", receiver);
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<JobStatus>().is_err());
    }
}
