//! Queue processor.
//!
//! A processing cycle claims a batch of pending jobs, delivers each job to
//! every receiver in its stored order, marks the job completed and records
//! the report. A job is completed once every receiver has a result, even if
//! all of them failed; there is no job-level retry.
//!
//! The claim is refreshed before every delivery. If another cycle has taken
//! the job over in the meantime (its claim went stale and was released), the
//! job is abandoned here without a report.
//!
//! [`QueueProcessor::run`] drives cycles on a fixed interval and sweeps old
//! queue rows and log entries on a slower one.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::time::MissedTickBehavior;

use crate::activity::ActivityLog;
use crate::config::QueueConfig;
use crate::delivery::DeliveryClient;
use crate::error::Result;
use crate::queue::{ClaimedJob, DurableQueue};
use crate::registry::ReceiverRegistry;
use crate::reports::ReportStore;
use crate::types::{Report, ReplicationJob};

/// What one processing cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    /// Jobs claimed from the queue
    pub claimed: usize,
    /// Jobs delivered and marked completed
    pub completed: usize,
    /// Jobs that could not be decoded and were marked failed
    pub skipped: usize,
    /// Jobs whose claim was taken over by another cycle
    pub abandoned: usize,
    pub reports: Vec<Report>,
}

/// What one retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub jobs_removed: usize,
    pub logs_removed: usize,
}

pub struct QueueProcessor {
    queue: Arc<DurableQueue>,
    registry: Arc<ReceiverRegistry>,
    delivery: DeliveryClient,
    reports: Arc<ReportStore>,
    activity: ActivityLog,
    config: QueueConfig,
    log_retention_days: u32,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<ReceiverRegistry>,
        delivery: DeliveryClient,
        reports: Arc<ReportStore>,
        activity: ActivityLog,
        config: QueueConfig,
        log_retention_days: u32,
    ) -> Self {
        Self {
            queue,
            registry,
            delivery,
            reports,
            activity,
            config,
            log_retention_days,
        }
    }

    /// Run one processing cycle.
    ///
    /// Only storage failures while claiming are returned as errors; problems
    /// with individual jobs or receivers are logged and the batch continues.
    pub async fn process_cycle(&self) -> Result<CycleOutcome> {
        self.queue
            .release_stale_claims(self.config.claim_timeout())?;

        let batch = self.queue.claim_batch(self.config.batch_size)?;
        let mut outcome = CycleOutcome {
            claimed: batch.jobs.len(),
            ..Default::default()
        };

        if batch.jobs.is_empty() {
            tracing::debug!("No pending jobs");
            return Ok(outcome);
        }

        tracing::info!(jobs = batch.jobs.len(), "Processing queue batch");

        for job in batch.jobs {
            match job {
                ClaimedJob::Ready(job) => match self.process_job(&job, &batch.token).await {
                    Some((completed, report)) => {
                        if completed {
                            outcome.completed += 1;
                        }
                        outcome.reports.push(report);
                    }
                    None => outcome.abandoned += 1,
                },
                ClaimedJob::Undecodable {
                    id,
                    post_id,
                    reason,
                } => {
                    self.activity.error(
                        "Skipping undecodable queue job",
                        json!({ "job_id": id, "post_id": post_id, "error": reason }),
                    );
                    if let Err(e) = self.queue.mark_failed(id, &batch.token, &reason) {
                        tracing::error!(job_id = id, error = %e, "Failed to mark job as failed");
                    }
                    outcome.skipped += 1;
                }
            }
        }

        tracing::info!(
            claimed = outcome.claimed,
            completed = outcome.completed,
            skipped = outcome.skipped,
            abandoned = outcome.abandoned,
            "Queue batch processed"
        );
        Ok(outcome)
    }

    /// Deliver one job to all of its receivers.
    ///
    /// Returns whether the job was marked completed, and its report, or
    /// `None` when the claim was lost to another cycle.
    async fn process_job(&self, job: &ReplicationJob, token: &str) -> Option<(bool, Report)> {
        let mut results = Vec::with_capacity(job.receivers.len());
        for snapshot in &job.receivers {
            if !self.hold_claim(job, token, results.len()) {
                return None;
            }
            let receiver = self.registry.resolve(snapshot);
            results.push(self.delivery.dispatch(&job.action, &receiver).await);
        }

        let completed = match self.queue.mark_completed(job.id, token, &results) {
            Ok(true) => true,
            Ok(false) => {
                self.claim_lost(job, results.len());
                return None;
            }
            Err(e) => {
                self.activity.error(
                    "Failed to mark queue job completed",
                    json!({ "job_id": job.id, "post_id": job.post_id, "error": e.to_string() }),
                );
                false
            }
        };

        let report = self.reports.record(job.post_id, &results);
        self.activity.info(
            "Queue job processed",
            json!({
                "job_id": job.id,
                "post_id": job.post_id,
                "action": job.action.kind().as_str(),
                "total": report.summary.total,
                "success": report.summary.success,
                "errors": report.summary.errors,
            }),
        );

        Some((completed, report))
    }

    fn hold_claim(&self, job: &ReplicationJob, token: &str, delivered: usize) -> bool {
        match self.queue.refresh_claim(job.id, token) {
            Ok(true) => true,
            Ok(false) => {
                self.claim_lost(job, delivered);
                false
            }
            Err(e) => {
                self.activity.error(
                    "Failed to refresh queue claim",
                    json!({ "job_id": job.id, "post_id": job.post_id, "error": e.to_string() }),
                );
                false
            }
        }
    }

    fn claim_lost(&self, job: &ReplicationJob, delivered: usize) {
        self.activity.warning(
            "Queue job claim lost to another cycle",
            json!({ "job_id": job.id, "post_id": job.post_id, "delivered": delivered }),
        );
    }

    /// Remove completed jobs and old activity log entries.
    pub fn cleanup(&self) -> Result<CleanupOutcome> {
        Ok(CleanupOutcome {
            jobs_removed: self.queue.cleanup(self.config.retention_days)?,
            logs_removed: self.activity.cleanup(self.log_retention_days)?,
        })
    }

    /// Process cycles until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cleanup: Option<Instant> = None;

        tracing::info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Queue processor started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process_cycle().await {
                tracing::error!(error = %e, "Processing cycle failed");
            }

            let cleanup_due = last_cleanup
                .map_or(true, |at| at.elapsed() >= self.config.cleanup_interval());
            if cleanup_due {
                match self.cleanup() {
                    Ok(swept) => tracing::debug!(?swept, "Retention sweep done"),
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
                last_cleanup = Some(Instant::now());
            }
        }

        tracing::info!("Queue processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, ReceiversConfig, ReportsConfig};
    use crate::db::Database;
    use crate::types::{ActionKind, DeleteRequest, JobAction, JobStatus};
    use crate::vault::Vault;
    use chrono::Utc;

    struct Fixture {
        db: Arc<Database>,
        queue: Arc<DurableQueue>,
        processor: QueueProcessor,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let activity = ActivityLog::new(Arc::clone(&db));
        let queue = Arc::new(DurableQueue::new(Arc::clone(&db), activity.clone()));
        let registry = Arc::new(ReceiverRegistry::new(
            Arc::clone(&db),
            Vault::with_secret("test"),
            ReceiversConfig::default(),
        ));
        let reports = Arc::new(ReportStore::new(
            Arc::clone(&db),
            activity.clone(),
            ReportsConfig::default(),
        ));
        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            registry,
            DeliveryClient::new(&DeliveryConfig::default()).unwrap(),
            reports,
            activity,
            QueueConfig::default(),
            30,
        );
        Fixture {
            db,
            queue,
            processor,
        }
    }

    #[tokio::test]
    async fn test_empty_queue_cycle() {
        let fx = fixture();
        let outcome = fx.processor.process_cycle().await.unwrap();
        assert_eq!(outcome.claimed, 0);
        assert!(outcome.reports.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_job_does_not_stop_the_batch() {
        let fx = fixture();
        let bad = fx
            .db
            .insert_job(1, ActionKind::Send, "{oops", "{oops", Utc::now())
            .unwrap();
        let good = fx
            .queue
            .enqueue_job(&JobAction::Delete(DeleteRequest::new(2)), &[], 2)
            .unwrap();

        let outcome = fx.processor.process_cycle().await.unwrap();
        assert_eq!(outcome.claimed, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].post_id, 2);
        assert_eq!(outcome.reports[0].summary.total, 0);

        assert_eq!(fx.db.get_job(bad).unwrap().unwrap().status, "failed");
        assert_eq!(
            fx.queue.get(good).unwrap().unwrap().status,
            JobStatus::Completed
        );

        let errors = fx
            .db
            .list_logs(Some(crate::types::LogLevel::Error), 10)
            .unwrap();
        assert!(errors
            .iter()
            .any(|e| e.message == "Skipping undecodable queue job"));
    }

    #[tokio::test]
    async fn test_cycle_respects_batch_size() {
        let fx = fixture();
        for post in 0..12 {
            fx.queue
                .enqueue_job(&JobAction::Delete(DeleteRequest::new(post)), &[], post)
                .unwrap();
        }

        let first = fx.processor.process_cycle().await.unwrap();
        assert_eq!(first.claimed, 10);
        let second = fx.processor.process_cycle().await.unwrap();
        assert_eq!(second.claimed, 2);

        let stats = fx.queue.stats().unwrap();
        assert_eq!(stats.completed, 12);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = fixture();
        fx.queue
            .enqueue_job(&JobAction::Delete(DeleteRequest::new(1)), &[], 1)
            .unwrap();

        // The first tick fires immediately, so one cycle runs before shutdown.
        fx.processor
            .run(tokio::time::sleep(std::time::Duration::from_millis(100)))
            .await;

        assert_eq!(fx.queue.stats().unwrap().completed, 1);
    }
}
