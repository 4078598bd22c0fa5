//! Persisted activity log.
//!
//! Every pipeline component records what it did through an [`ActivityLog`].
//! Entries land in the `logs` table (so an operator can list them later) and
//! are mirrored to `tracing` at the same level. Writing an entry never fails
//! the caller: a storage error is reported to tracing and swallowed.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use crate::db::Database;
use crate::error::Result;
use crate::types::{LogEntry, LogLevel};

/// Default number of entries returned by [`ActivityLog::entries`] callers.
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct ActivityLog {
    db: Arc<Database>,
    actor_id: Option<i64>,
}

impl ActivityLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, actor_id: None }
    }

    /// A handle whose entries are attributed to `actor_id`.
    pub fn with_actor(&self, actor_id: i64) -> Self {
        Self {
            db: Arc::clone(&self.db),
            actor_id: Some(actor_id),
        }
    }

    pub fn actor_id(&self) -> Option<i64> {
        self.actor_id
    }

    pub fn log(&self, level: LogLevel, message: &str, context: Value) {
        let context = match context {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        match level {
            LogLevel::Debug => tracing::debug!(actor_id = ?self.actor_id, %context, "{message}"),
            LogLevel::Info => tracing::info!(actor_id = ?self.actor_id, %context, "{message}"),
            LogLevel::Warning => tracing::warn!(actor_id = ?self.actor_id, %context, "{message}"),
            LogLevel::Error => tracing::error!(actor_id = ?self.actor_id, %context, "{message}"),
        }

        if let Err(e) = self
            .db
            .insert_log(level, message, &context, Utc::now(), self.actor_id)
        {
            tracing::error!(error = %e, entry = message, "Failed to persist activity log entry");
        }
    }

    pub fn debug(&self, message: &str, context: Value) {
        self.log(LogLevel::Debug, message, context);
    }

    pub fn info(&self, message: &str, context: Value) {
        self.log(LogLevel::Info, message, context);
    }

    pub fn warning(&self, message: &str, context: Value) {
        self.log(LogLevel::Warning, message, context);
    }

    pub fn error(&self, message: &str, context: Value) {
        self.log(LogLevel::Error, message, context);
    }

    /// Stored entries, newest first, optionally restricted to one level.
    pub fn entries(&self, level: Option<LogLevel>, limit: usize) -> Result<Vec<LogEntry>> {
        self.db.list_logs(level, limit)
    }

    /// Delete entries older than `retention_days`.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let removed = self.db.delete_logs_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "Pruned activity log");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_log() -> (Arc<Database>, ActivityLog) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let log = ActivityLog::new(Arc::clone(&db));
        (db, log)
    }

    #[test]
    fn test_entries_are_persisted_with_context() {
        let (_db, log) = test_log();
        log.info("Post sent", json!({"receiver_url": "https://a.example", "response_code": 200}));
        log.error("Send failed", json!({"receiver_url": "https://b.example"}));

        let entries = log.entries(None, DEFAULT_LIST_LIMIT).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Send failed");
        assert_eq!(entries[1].context["response_code"], 200);

        let errors = log.entries(Some(LogLevel::Error), DEFAULT_LIST_LIMIT).unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_null_context_is_stored_as_empty_object() {
        let (_db, log) = test_log();
        log.debug("tick", Value::Null);
        let entries = log.entries(None, 1).unwrap();
        assert_eq!(entries[0].context, json!({}));
    }

    #[test]
    fn test_actor_is_attached() {
        let (_db, log) = test_log();
        log.with_actor(3).warning("Receiver list empty", json!({}));
        log.info("anonymous", json!({}));

        let entries = log.entries(None, 10).unwrap();
        assert_eq!(entries[1].actor_id, Some(3));
        assert_eq!(entries[0].actor_id, None);
    }

    #[test]
    fn test_cleanup_removes_only_old_entries() {
        let (db, log) = test_log();
        db.insert_log(
            LogLevel::Info,
            "old",
            &json!({}),
            Utc::now() - Duration::days(31),
            None,
        )
        .unwrap();
        log.info("fresh", json!({}));

        assert_eq!(log.cleanup(30).unwrap(), 1);
        let entries = log.entries(None, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "fresh");
    }

    #[test]
    fn test_write_failure_does_not_panic() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // No migrations: the insert fails and is swallowed.
        let log = ActivityLog::new(db);
        log.error("lost", json!({}));
    }
}
