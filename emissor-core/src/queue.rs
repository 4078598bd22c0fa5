//! Durable replication queue.
//!
//! Jobs are rows in `queue_jobs`. The action and the receiver snapshots are
//! stored as versioned JSON envelopes:
//!
//! ```json
//! {"v":1,"action":{"type":"send","data":{"ID":42,"title":"..."}}}
//! {"v":1,"receivers":[{"id":1,"name":"...","url":"...","sealed_token":"..."}]}
//! ```
//!
//! A row moves `pending -> processing -> completed`. The `processing` step
//! is the claim: [`DurableQueue::claim_batch`] flips rows atomically and
//! stamps them with a token owned by the claiming cycle. Only the owner can
//! refresh or finish a claimed row, so when a stale claim is released and
//! picked up again the first cycle stops touching it. `pending ->
//! cancelled` only happens on request, and `failed` marks rows whose
//! envelopes cannot be decoded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::activity::ActivityLog;
use crate::db::{Database, JobRecord};
use crate::error::{Error, Result};
use crate::types::{
    DeliveryResult, JobAction, JobStatus, QueueStats, ReceiverSnapshot, ReplicationJob,
};

/// Envelope version written by this build.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Serialize)]
struct ActionEnvelopeRef<'a> {
    v: u32,
    action: &'a JobAction,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    v: u32,
    action: JobAction,
}

#[derive(Serialize)]
struct ReceiversEnvelopeRef<'a> {
    v: u32,
    receivers: &'a [ReceiverSnapshot],
}

#[derive(Deserialize)]
struct ReceiversEnvelope {
    v: u32,
    receivers: Vec<ReceiverSnapshot>,
}

/// Jobs claimed by one cycle, and the token that proves ownership.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub token: String,
    pub jobs: Vec<ClaimedJob>,
}

/// A job handed out by [`DurableQueue::claim_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimedJob {
    Ready(ReplicationJob),
    /// The row was claimed but its envelopes could not be decoded.
    Undecodable { id: i64, post_id: i64, reason: String },
}

impl ClaimedJob {
    pub fn id(&self) -> i64 {
        match self {
            ClaimedJob::Ready(job) => job.id,
            ClaimedJob::Undecodable { id, .. } => *id,
        }
    }
}

/// Row summary for inspection, readable even when the payload is not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub post_id: i64,
    pub action: String,
    pub status: String,
    pub receiver_count: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub struct DurableQueue {
    db: Arc<Database>,
    activity: ActivityLog,
}

impl DurableQueue {
    pub fn new(db: Arc<Database>, activity: ActivityLog) -> Self {
        Self { db, activity }
    }

    /// Persist a job. Returns whether the write succeeded.
    ///
    /// Never touches the network.
    pub fn enqueue(&self, action: &JobAction, receivers: &[ReceiverSnapshot], post_id: i64) -> bool {
        self.enqueue_job(action, receivers, post_id).is_ok()
    }

    /// Persist a job and return its id.
    ///
    /// A failed write is logged at `error` before it is returned.
    pub fn enqueue_job(
        &self,
        action: &JobAction,
        receivers: &[ReceiverSnapshot],
        post_id: i64,
    ) -> Result<i64> {
        self.insert(action, receivers, post_id).map_err(|e| {
            self.activity.error(
                "Failed to enqueue replication job",
                json!({
                    "post_id": post_id,
                    "action": action.kind().as_str(),
                    "error": e.to_string(),
                }),
            );
            e
        })
    }

    fn insert(
        &self,
        action: &JobAction,
        receivers: &[ReceiverSnapshot],
        post_id: i64,
    ) -> Result<i64> {
        let payload = serde_json::to_string(&ActionEnvelopeRef {
            v: ENVELOPE_VERSION,
            action,
        })?;
        let receivers_json = serde_json::to_string(&ReceiversEnvelopeRef {
            v: ENVELOPE_VERSION,
            receivers,
        })?;

        let id = self.db.insert_job(
            post_id,
            action.kind(),
            &payload,
            &receivers_json,
            Utc::now(),
        )?;

        tracing::debug!(
            job_id = id,
            post_id,
            action = action.kind().as_str(),
            receivers = receivers.len(),
            "Job enqueued"
        );
        Ok(id)
    }

    /// Oldest pending jobs first, at most `limit`, without claiming them.
    ///
    /// Rows that cannot be decoded are left out.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<ReplicationJob>> {
        let records = self.db.pending_jobs(limit)?;
        Ok(records
            .into_iter()
            .filter_map(|record| match decode(&record) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(job_id = record.id, error = %e, "Skipping undecodable job");
                    None
                }
            })
            .collect())
    }

    /// Claim up to `limit` of the oldest pending jobs for processing.
    pub fn claim_batch(&self, limit: usize) -> Result<ClaimedBatch> {
        let token = hex::encode(rand::random::<[u8; 16]>());
        let records = self.db.claim_pending_jobs(limit, &token, Utc::now())?;
        let jobs = records
            .into_iter()
            .map(|record| match decode(&record) {
                Ok(job) => ClaimedJob::Ready(job),
                Err(e) => ClaimedJob::Undecodable {
                    id: record.id,
                    post_id: record.post_id,
                    reason: e.to_string(),
                },
            })
            .collect();
        Ok(ClaimedBatch { token, jobs })
    }

    /// Restamp a claim before more work is done under it.
    ///
    /// Returns false when the job is no longer held by `token`.
    pub fn refresh_claim(&self, job_id: i64, token: &str) -> Result<bool> {
        self.db.refresh_claim(job_id, token, Utc::now())
    }

    /// Return claims older than `older_than` to `pending`.
    pub fn release_stale_claims(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("claim timeout out of range: {}", e)))?;
        let released = self.db.release_claims_before(Utc::now() - age)?;
        if released > 0 {
            self.activity.warning(
                "Released stale queue claims",
                json!({ "released": released }),
            );
        }
        Ok(released)
    }

    /// Store results and complete a job held by `token`.
    pub fn mark_completed(
        &self,
        job_id: i64,
        token: &str,
        results: &[DeliveryResult],
    ) -> Result<bool> {
        let results = serde_json::to_string(results)?;
        self.db.complete_job(job_id, token, &results, Utc::now())
    }

    pub fn mark_failed(&self, job_id: i64, token: &str, reason: &str) -> Result<bool> {
        self.db.fail_job(job_id, token, reason, Utc::now())
    }

    /// Cancel a job that is still pending.
    pub fn cancel(&self, job_id: i64) -> Result<bool> {
        let cancelled = self.db.cancel_job(job_id)?;
        if cancelled {
            self.activity
                .info("Queue job cancelled", json!({ "job_id": job_id }));
        }
        Ok(cancelled)
    }

    /// Delete completed jobs processed more than `retention_days` ago.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let removed = self.db.delete_completed_before(cutoff)?;
        if removed > 0 {
            self.activity.info(
                "Removed completed queue jobs",
                json!({ "removed": removed, "retention_days": retention_days }),
            );
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (status, count) in self.db.count_jobs_by_status()? {
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Cancelled) => stats.cancelled = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(_) => tracing::warn!(status, count, "Unknown job status in queue"),
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Load and decode one job.
    pub fn get(&self, job_id: i64) -> Result<Option<ReplicationJob>> {
        self.db
            .get_job(job_id)?
            .map(|record| decode(&record))
            .transpose()
    }

    /// Summaries of jobs, newest first.
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<QueueEntry>> {
        Ok(self
            .db
            .list_jobs(status, limit)?
            .into_iter()
            .map(|record| QueueEntry {
                receiver_count: decode_receivers(&record.receivers).ok().map(|r| r.len()),
                id: record.id,
                post_id: record.post_id,
                action: record.action,
                status: record.status,
                created_at: record.created_at,
                processed_at: record.processed_at,
                error: record.error,
            })
            .collect())
    }
}

fn decode(record: &JobRecord) -> Result<ReplicationJob> {
    let envelope: ActionEnvelope = serde_json::from_str(&record.payload)
        .map_err(|e| Error::Payload(format!("job {}: action: {}", record.id, e)))?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(Error::Payload(format!(
            "job {}: unsupported action envelope version {}",
            record.id, envelope.v
        )));
    }
    if envelope.action.kind().as_str() != record.action {
        return Err(Error::Payload(format!(
            "job {}: action column `{}` does not match payload `{}`",
            record.id,
            record.action,
            envelope.action.kind().as_str()
        )));
    }

    let receivers = decode_receivers(&record.receivers)
        .map_err(|e| Error::Payload(format!("job {}: receivers: {}", record.id, e)))?;

    let status = record
        .status
        .parse::<JobStatus>()
        .map_err(|e| Error::Payload(format!("job {}: {}", record.id, e)))?;

    Ok(ReplicationJob {
        id: record.id,
        post_id: record.post_id,
        action: envelope.action,
        receivers,
        status,
        created_at: record.created_at,
        processed_at: record.processed_at,
    })
}

fn decode_receivers(raw: &str) -> Result<Vec<ReceiverSnapshot>> {
    let envelope: ReceiversEnvelope = serde_json::from_str(raw)?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(Error::Payload(format!(
            "unsupported receivers envelope version {}",
            envelope.v
        )));
    }
    Ok(envelope.receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, DeleteRequest, DeliveryStatus, PostPayload, StatusUpdate};

    fn queue() -> (Arc<Database>, DurableQueue) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let queue = DurableQueue::new(Arc::clone(&db), ActivityLog::new(Arc::clone(&db)));
        (db, queue)
    }

    fn snapshot(id: i64) -> ReceiverSnapshot {
        ReceiverSnapshot {
            id,
            name: format!("r{}", id),
            url: format!("https://r{}.example/", id),
            sealed_token: Some("c2VhbGVk".to_string()),
        }
    }

    fn send(post_id: i64) -> JobAction {
        JobAction::Send(PostPayload {
            post_id,
            title: "Title".to_string(),
            content: "Body".to_string(),
            slug: "title".to_string(),
            status: "publish".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_enqueue_round_trips_action_and_receivers() {
        let (_db, queue) = queue();
        let id = queue
            .enqueue_job(&send(42), &[snapshot(1), snapshot(2)], 42)
            .unwrap();

        let job = queue.get(id).unwrap().unwrap();
        assert_eq!(job.post_id, 42);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.action, send(42));
        assert_eq!(job.receivers, vec![snapshot(1), snapshot(2)]);
    }

    #[test]
    fn test_envelope_shape_on_disk() {
        let (db, queue) = queue();
        let action = JobAction::UpdateStatus(StatusUpdate {
            post_id: 7,
            status: "draft".to_string(),
        });
        let id = queue.enqueue_job(&action, &[snapshot(1)], 7).unwrap();

        let record = db.get_job(id).unwrap().unwrap();
        let payload: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(payload["v"], 1);
        assert_eq!(payload["action"]["type"], "update_status");
        assert_eq!(payload["action"]["data"]["ID"], 7);
        assert_eq!(record.action, ActionKind::UpdateStatus.as_str());

        let receivers: serde_json::Value = serde_json::from_str(&record.receivers).unwrap();
        assert_eq!(receivers["v"], 1);
        assert_eq!(receivers["receivers"][0]["sealed_token"], "c2VhbGVk");
    }

    #[test]
    fn test_dequeue_batch_is_bounded_and_fifo() {
        let (_db, queue) = queue();
        let ids: Vec<i64> = (0..12)
            .map(|n| queue.enqueue_job(&send(n), &[snapshot(1)], n).unwrap())
            .collect();

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 10);
        let batch_ids: Vec<i64> = batch.iter().map(|j| j.id).collect();
        assert_eq!(batch_ids, ids[..10].to_vec());
        assert!(batch
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));

        // Read-only: the same jobs come back again.
        assert_eq!(queue.dequeue_batch(10).unwrap().len(), 10);
    }

    #[test]
    fn test_claimed_jobs_leave_pending() {
        let (_db, queue) = queue();
        for n in 0..3 {
            queue.enqueue_job(&send(n), &[snapshot(1)], n).unwrap();
        }

        let claimed = queue.claim_batch(2).unwrap();
        assert_eq!(claimed.jobs.len(), 2);
        assert_eq!(claimed.token.len(), 32);
        assert_eq!(queue.dequeue_batch(10).unwrap().len(), 1);

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_undecodable_rows_are_reported_not_fatal() {
        let (db, queue) = queue();
        let good = queue.enqueue_job(&send(1), &[snapshot(1)], 1).unwrap();
        let bad = db
            .insert_job(2, ActionKind::Send, "{not json", "{}", Utc::now())
            .unwrap();
        let future = db
            .insert_job(
                3,
                ActionKind::Delete,
                r#"{"v":9,"action":{"type":"delete","data":{"ID":3,"action":"delete"}}}"#,
                r#"{"v":1,"receivers":[]}"#,
                Utc::now(),
            )
            .unwrap();

        let batch = queue.claim_batch(10).unwrap();
        let claimed = &batch.jobs;
        assert_eq!(claimed.len(), 3);
        assert!(matches!(&claimed[0], ClaimedJob::Ready(job) if job.id == good));
        assert!(matches!(&claimed[1], ClaimedJob::Undecodable { id, .. } if *id == bad));
        assert!(matches!(&claimed[2], ClaimedJob::Undecodable { id, .. } if *id == future));

        assert!(queue.mark_failed(bad, &batch.token, "bad payload").unwrap());
        assert!(matches!(queue.get(bad), Err(Error::Payload(_))));
    }

    #[test]
    fn test_mark_completed_stores_results() {
        let (db, queue) = queue();
        let id = queue.enqueue_job(&send(1), &[snapshot(1)], 1).unwrap();
        let batch = queue.claim_batch(1).unwrap();

        let results = vec![DeliveryResult {
            receiver_url: "https://r1.example/".to_string(),
            status: DeliveryStatus::Ok,
            message: "response code: 200".to_string(),
            response_code: Some(200),
            attempts: 1,
        }];
        assert!(queue.mark_completed(id, &batch.token, &results).unwrap());
        assert!(!queue.mark_completed(id, &batch.token, &results).unwrap());

        let job = queue.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processed_at.is_some());

        let stored = db.get_job(id).unwrap().unwrap().results.unwrap();
        let decoded: Vec<DeliveryResult> = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, results);
    }

    #[test]
    fn test_cancel_only_pending() {
        let (_db, queue) = queue();
        let pending = queue.enqueue_job(&send(1), &[snapshot(1)], 1).unwrap();
        let claimed = queue
            .enqueue_job(&JobAction::Delete(DeleteRequest::new(2)), &[snapshot(1)], 2)
            .unwrap();
        assert!(queue.cancel(pending).unwrap());

        queue.claim_batch(10).unwrap();
        assert!(!queue.cancel(claimed).unwrap());
        assert!(!queue.cancel(9999).unwrap());

        let stats = queue.stats().unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.processing, 1);
    }

    #[test]
    fn test_cleanup_keeps_recent_and_unfinished_jobs() {
        let (db, queue) = queue();
        let now = Utc::now();
        let old_done = queue.enqueue_job(&send(1), &[], 1).unwrap();
        let new_done = queue.enqueue_job(&send(2), &[], 2).unwrap();
        let token = queue.claim_batch(2).unwrap().token;
        db.complete_job(old_done, &token, "[]", now - chrono::Duration::days(8))
            .unwrap();
        db.complete_job(new_done, &token, "[]", now - chrono::Duration::days(6))
            .unwrap();
        let pending = queue.enqueue_job(&send(3), &[], 3).unwrap();
        let cancelled = queue.enqueue_job(&send(4), &[], 4).unwrap();
        queue.cancel(cancelled).unwrap();

        assert_eq!(queue.cleanup(7).unwrap(), 1);
        assert!(db.get_job(old_done).unwrap().is_none());
        for id in [new_done, pending, cancelled] {
            assert!(db.get_job(id).unwrap().is_some());
        }
    }

    #[test]
    fn test_release_stale_claims_requeues() {
        let (db, queue) = queue();
        let id = queue.enqueue_job(&send(1), &[], 1).unwrap();
        db.claim_pending_jobs(1, "old", Utc::now() - chrono::Duration::minutes(20))
            .unwrap();

        assert_eq!(queue.release_stale_claims(Duration::from_secs(600)).unwrap(), 1);
        assert_eq!(queue.get(id).unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(queue.release_stale_claims(Duration::from_secs(600)).unwrap(), 0);
    }

    #[test]
    fn test_list_survives_undecodable_rows() {
        let (db, queue) = queue();
        queue.enqueue_job(&send(1), &[snapshot(1), snapshot(2)], 1).unwrap();
        db.insert_job(2, ActionKind::Send, "garbage", "garbage", Utc::now())
            .unwrap();

        let entries = queue.list(None, 10).unwrap();
        assert_eq!(entries.len(), 2);
        let counts: Vec<Option<usize>> = entries.iter().map(|e| e.receiver_count).collect();
        assert!(counts.contains(&Some(2)));
        assert!(counts.contains(&None));
    }

    #[test]
    fn test_enqueue_reports_write_failure() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // No migrations, so the insert fails.
        let queue = DurableQueue::new(Arc::clone(&db), ActivityLog::new(db));
        assert!(!queue.enqueue(&send(1), &[snapshot(1)], 1));
    }

    #[test]
    fn test_enqueue_job_logs_write_failure() {
        let (db, queue) = queue();
        db.connection().execute("DROP TABLE queue_jobs", []).unwrap();

        assert!(queue.enqueue_job(&send(5), &[snapshot(1)], 5).is_err());

        let errors = db.list_logs(Some(crate::types::LogLevel::Error), 10).unwrap();
        let entry = errors
            .iter()
            .find(|e| e.message == "Failed to enqueue replication job")
            .expect("enqueue failure should be logged");
        assert_eq!(entry.context["post_id"], 5);
        assert_eq!(entry.context["action"], "send");
    }

    #[test]
    fn test_released_claim_cannot_be_finished_by_its_old_owner() {
        let (db, queue) = queue();
        let id = queue.enqueue_job(&send(1), &[snapshot(1)], 1).unwrap();
        let first = queue.claim_batch(10).unwrap();

        // Age the first claim past the timeout, then let a second cycle take it.
        db.connection()
            .execute(
                "UPDATE queue_jobs SET claimed_at = ?1",
                [crate::db::encode_ts(Utc::now() - chrono::Duration::minutes(20))],
            )
            .unwrap();
        assert_eq!(queue.release_stale_claims(Duration::from_secs(600)).unwrap(), 1);
        let second = queue.claim_batch(10).unwrap();
        assert_eq!(second.jobs.len(), 1);
        assert_ne!(first.token, second.token);

        assert!(!queue.refresh_claim(id, &first.token).unwrap());
        assert!(!queue.mark_completed(id, &first.token, &[]).unwrap());
        assert!(queue.refresh_claim(id, &second.token).unwrap());
        assert!(queue.mark_completed(id, &second.token, &[]).unwrap());
    }
}
