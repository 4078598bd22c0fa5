//! Delivery reports.
//!
//! Every processed job produces a [`Report`]. Reports are kept in the
//! `reports` table as history, and the latest one per post is also placed in
//! a notification slot that expires after `notification_ttl_hours` and is
//! deleted the first time it is read.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use crate::activity::ActivityLog;
use crate::config::ReportsConfig;
use crate::db::Database;
use crate::error::Result;
use crate::types::{DeliveryResult, GeneralStats, Report};

/// Default number of reports returned by [`ReportStore::get_recent`] callers.
pub const DEFAULT_RECENT_LIMIT: usize = 10;

fn notification_slot(post_id: i64) -> String {
    format!("report:{}", post_id)
}

pub struct ReportStore {
    db: Arc<Database>,
    activity: ActivityLog,
    config: ReportsConfig,
}

impl ReportStore {
    pub fn new(db: Arc<Database>, activity: ActivityLog, config: ReportsConfig) -> Self {
        Self {
            db,
            activity,
            config,
        }
    }

    /// Build the report for a processed job and persist it.
    ///
    /// Storage failures are logged and the report is still returned, so
    /// delivery accounting never depends on the report tables.
    pub fn record(&self, post_id: i64, results: &[DeliveryResult]) -> Report {
        let report = Report::new(post_id, results.to_vec());

        if let Err(e) = self.db.insert_report(&report) {
            self.activity.error(
                "Failed to store delivery report",
                json!({ "post_id": post_id, "error": e.to_string() }),
            );
        }

        if let Err(e) = self.notify(&report) {
            self.activity.error(
                "Failed to store report notification",
                json!({ "post_id": post_id, "error": e.to_string() }),
            );
        }

        report
    }

    pub fn get_latest(&self, post_id: i64) -> Result<Option<Report>> {
        self.db.latest_report(post_id)
    }

    pub fn get_recent(&self, limit: usize) -> Result<Vec<Report>> {
        self.db.recent_reports(limit)
    }

    pub fn general_stats(&self) -> Result<GeneralStats> {
        self.db.report_totals()
    }

    /// Read and consume the pending notification for a post.
    pub fn take_notification(&self, post_id: i64) -> Result<Option<Report>> {
        let payload = self
            .db
            .take_notification(&notification_slot(post_id), Utc::now())?;

        match payload {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(report) => Ok(Some(report)),
                Err(e) => {
                    tracing::warn!(post_id, error = %e, "Discarding unreadable report notification");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn notify(&self, report: &Report) -> Result<()> {
        let expires_at = Utc::now() + Duration::hours(i64::from(self.config.notification_ttl_hours));
        let payload = serde_json::to_string(report)?;
        self.db
            .put_notification(&notification_slot(report.post_id), &payload, expires_at)
    }
}
