//! Database repository layer
//!
//! Provides row-level query and insert operations for receivers, queue jobs,
//! reports, settings, notifications and the activity log. Domain rules
//! (encryption, validation, envelope decoding) live in the modules that wrap
//! these calls.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Receiver row with its token still sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReceiver {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub sealed_token: Option<String>,
    pub status: ReceiverStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue row before its JSON envelopes are decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: i64,
    pub post_id: i64,
    pub action: String,
    pub payload: String,
    pub receivers: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub results: Option<String>,
    pub error: Option<String>,
}

/// Encode a timestamp in the fixed-width form every table uses.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn decode_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the CLI read while a worker writes; busy_timeout covers the
        // short window where two processes race for the claim transaction.
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Settings
    // ============================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection();
        conn.query_row("SELECT value FROM settings WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Error::from)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, encode_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Store `value` under `key` unless a value exists, and return whichever
    /// value ends up stored.
    pub fn setting_or_insert(&self, key: &str, value: &str) -> Result<String> {
        let conn = self.connection();
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, encode_ts(Utc::now())],
        )?;
        conn.query_row("SELECT value FROM settings WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .map_err(Error::from)
    }

    // ============================================
    // Receiver operations
    // ============================================

    pub fn insert_receiver(
        &self,
        name: &str,
        url: &str,
        sealed_token: Option<&str>,
        status: ReceiverStatus,
    ) -> Result<i64> {
        let conn = self.connection();
        let now = encode_ts(Utc::now());
        conn.execute(
            r#"
            INSERT INTO receivers (name, url, auth_token, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![name, url, sealed_token, status.as_str(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update a receiver. A `sealed_token` of `None` keeps the stored token.
    ///
    /// Returns `false` when no receiver has this id.
    pub fn update_receiver(
        &self,
        id: i64,
        name: &str,
        url: &str,
        sealed_token: Option<&str>,
        status: ReceiverStatus,
    ) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            r#"
            UPDATE receivers SET
                name = ?2,
                url = ?3,
                auth_token = COALESCE(?4, auth_token),
                status = ?5,
                updated_at = ?6
            WHERE id = ?1
            "#,
            params![
                id,
                name,
                url,
                sealed_token,
                status.as_str(),
                encode_ts(Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_receiver(&self, id: i64) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute("DELETE FROM receivers WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    pub fn get_receiver(&self, id: i64) -> Result<Option<StoredReceiver>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM receivers WHERE id = ?",
            [id],
            Self::row_to_receiver,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All receivers in insertion order
    pub fn list_receivers(&self) -> Result<Vec<StoredReceiver>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM receivers ORDER BY id ASC")?;
        let rows = stmt.query_map([], Self::row_to_receiver)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_receiver(row: &Row) -> rusqlite::Result<StoredReceiver> {
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(StoredReceiver {
            id: row.get("id")?,
            name: row.get("name")?,
            url: row.get("url")?,
            sealed_token: row
                .get::<_, Option<String>>("auth_token")?
                .filter(|t| !t.is_empty()),
            status: status.parse().unwrap_or(ReceiverStatus::Inactive),
            created_at: decode_ts(&created_at),
            updated_at: decode_ts(&updated_at),
        })
    }

    // ============================================
    // Queue operations
    // ============================================

    pub fn insert_job(
        &self,
        post_id: i64,
        action: ActionKind,
        payload: &str,
        receivers: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO queue_jobs (post_id, action, payload, receivers, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            "#,
            params![
                post_id,
                action.as_str(),
                payload,
                receivers,
                encode_ts(created_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM queue_jobs WHERE id = ?",
            [id],
            Self::row_to_job,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Pending jobs, oldest first
    pub fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM queue_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_job)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Jobs filtered by status (newest first), for inspection
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM queue_jobs
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            Self::row_to_job,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Move up to `limit` of the oldest pending jobs to `processing`,
    /// owned by `token`.
    ///
    /// Runs under `BEGIN IMMEDIATE`, so two concurrent cycles (even in
    /// separate processes) never claim the same row.
    pub fn claim_pending_jobs(
        &self,
        limit: usize,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let mut conn = self.connection();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM queue_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT ?
                "#,
            )?;
            let rows = stmt.query_map([limit as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let claimed_at = encode_ts(now);
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = tx.execute(
                r#"
                UPDATE queue_jobs
                SET status = 'processing', claimed_at = ?2, claim_token = ?3
                WHERE id = ?1 AND status = 'pending'
                "#,
                params![id, claimed_at, token],
            )?;
            if changed == 1 {
                let record =
                    tx.query_row("SELECT * FROM queue_jobs WHERE id = ?", [id], Self::row_to_job)?;
                claimed.push(record);
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Restamp `claimed_at` on a job still held by `token`.
    ///
    /// Returns false when the claim was released or taken by another cycle.
    pub fn refresh_claim(&self, id: i64, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            r#"
            UPDATE queue_jobs SET claimed_at = ?3
            WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
            "#,
            params![id, token, encode_ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// Return `processing` jobs claimed before `cutoff` to `pending`.
    pub fn release_claims_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection();
        let changed = conn.execute(
            r#"
            UPDATE queue_jobs SET status = 'pending', claimed_at = NULL, claim_token = NULL
            WHERE status = 'processing' AND claimed_at < ?
            "#,
            [encode_ts(cutoff)],
        )?;
        Ok(changed)
    }

    /// Mark a job held by `token` completed with its results.
    pub fn complete_job(
        &self,
        id: i64,
        token: &str,
        results: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            r#"
            UPDATE queue_jobs SET status = 'completed', processed_at = ?3, results = ?4
            WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
            "#,
            params![id, token, encode_ts(now), results],
        )?;
        Ok(changed > 0)
    }

    /// Mark a job held by `token` as permanently failed.
    pub fn fail_job(&self, id: i64, token: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            r#"
            UPDATE queue_jobs SET status = 'failed', processed_at = ?3, error = ?4
            WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
            "#,
            params![id, token, encode_ts(now), error],
        )?;
        Ok(changed > 0)
    }

    /// Cancel a job that has not been picked up yet.
    pub fn cancel_job(&self, id: i64) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            "UPDATE queue_jobs SET status = 'cancelled' WHERE id = ? AND status = 'pending'",
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Delete completed jobs processed before `cutoff`.
    pub fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection();
        let changed = conn.execute(
            "DELETE FROM queue_jobs WHERE status = 'completed' AND processed_at < ?",
            [encode_ts(cutoff)],
        )?;
        Ok(changed)
    }

    pub fn count_jobs_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<JobRecord> {
        let created_at: String = row.get("created_at")?;

        Ok(JobRecord {
            id: row.get("id")?,
            post_id: row.get("post_id")?,
            action: row.get("action")?,
            payload: row.get("payload")?,
            receivers: row.get("receivers")?,
            status: row.get("status")?,
            created_at: decode_ts(&created_at),
            claimed_at: decode_opt_ts(row.get("claimed_at")?),
            claim_token: row.get("claim_token")?,
            processed_at: decode_opt_ts(row.get("processed_at")?),
            results: row.get("results")?,
            error: row.get("error")?,
        })
    }

    // ============================================
    // Report operations
    // ============================================

    pub fn insert_report(&self, report: &Report) -> Result<i64> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO reports (post_id, timestamp, results, total, success, errors, success_rate)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                report.post_id,
                encode_ts(report.timestamp),
                serde_json::to_string(&report.results)?,
                report.summary.total as i64,
                report.summary.success as i64,
                report.summary.errors as i64,
                report.summary.success_rate,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent report for a post
    pub fn latest_report(&self, post_id: i64) -> Result<Option<Report>> {
        let conn = self.connection();
        conn.query_row(
            r#"
            SELECT * FROM reports WHERE post_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
            [post_id],
            Self::row_to_report,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Most recent reports across all posts
    pub fn recent_reports(&self, limit: usize) -> Result<Vec<Report>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT * FROM reports ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_report)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Sum delivery counts over every stored report
    pub fn report_totals(&self) -> Result<GeneralStats> {
        let conn = self.connection();
        let (total_reports, success_count, error_count): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(success), 0), COALESCE(SUM(errors), 0)
            FROM reports
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let deliveries = (success_count + error_count).max(0) as usize;
        Ok(GeneralStats {
            total_reports,
            success_count,
            error_count,
            success_rate: percentage(success_count.max(0) as usize, deliveries),
        })
    }

    fn row_to_report(row: &Row) -> rusqlite::Result<Report> {
        let timestamp: String = row.get("timestamp")?;
        let results: String = row.get("results")?;
        let total: i64 = row.get("total")?;
        let success: i64 = row.get("success")?;
        let errors: i64 = row.get("errors")?;

        Ok(Report {
            post_id: row.get("post_id")?,
            timestamp: decode_ts(&timestamp),
            results: serde_json::from_str(&results).unwrap_or_default(),
            summary: ReportSummary {
                total: total.max(0) as usize,
                success: success.max(0) as usize,
                errors: errors.max(0) as usize,
                success_rate: row.get("success_rate")?,
            },
        })
    }

    // ============================================
    // Notification slot
    // ============================================

    pub fn put_notification(
        &self,
        slot: &str,
        payload: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO notifications (slot, payload, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(slot) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at
            "#,
            params![slot, payload, encode_ts(expires_at)],
        )?;
        Ok(())
    }

    /// Remove the slot and return its payload if it had not expired.
    pub fn take_notification(&self, slot: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let payload: Option<String> = tx
            .query_row(
                "SELECT payload FROM notifications WHERE slot = ?1 AND expires_at > ?2",
                params![slot, encode_ts(now)],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute("DELETE FROM notifications WHERE slot = ?", [slot])?;
        tx.commit()?;
        Ok(payload)
    }

    // ============================================
    // Activity log
    // ============================================

    pub fn insert_log(
        &self,
        level: LogLevel,
        message: &str,
        context: &serde_json::Value,
        timestamp: DateTime<Utc>,
        actor_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO logs (level, message, context, timestamp, actor_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                level.as_str(),
                message,
                context.to_string(),
                encode_ts(timestamp),
                actor_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Log entries newest first, optionally filtered by level
    pub fn list_logs(&self, level: Option<LogLevel>, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM logs
            WHERE (?1 IS NULL OR level = ?1)
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![level.map(|l| l.as_str()), limit as i64],
            Self::row_to_log,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection();
        let changed = conn.execute("DELETE FROM logs WHERE timestamp < ?", [encode_ts(cutoff)])?;
        Ok(changed)
    }

    fn row_to_log(row: &Row) -> rusqlite::Result<LogEntry> {
        let level: String = row.get("level")?;
        let context: String = row.get("context")?;
        let timestamp: String = row.get("timestamp")?;

        Ok(LogEntry {
            id: row.get("id")?,
            level: level.parse().unwrap_or(LogLevel::Info),
            message: row.get("message")?,
            context: serde_json::from_str(&context).unwrap_or(serde_json::json!({})),
            timestamp: decode_ts(&timestamp),
            actor_id: row.get("actor_id")?,
        })
    }
}
