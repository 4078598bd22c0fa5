//! Inbound interface for the event producer.
//!
//! The host site reports post lifecycle events here together with the
//! receiver indices the author selected. Each event turns into at most one
//! queued job; nothing here touches the network except the optional
//! translation step.
//!
//! The translator runs its own blocking runtime, so these calls must not be
//! made from inside an async task when translation is configured.

use std::sync::Arc;

use serde_json::json;

use crate::activity::ActivityLog;
use crate::error::{Error, Result};
use crate::queue::DurableQueue;
use crate::registry::ReceiverRegistry;
use crate::translation::{TranslationContext, Translator};
use crate::types::{DeleteRequest, JobAction, PostPayload, ReceiverSnapshot, StatusUpdate};
use crate::validation::{normalize_post_status, validate_post};

const PUBLISH: &str = "publish";

pub struct EventTrigger {
    registry: Arc<ReceiverRegistry>,
    queue: Arc<DurableQueue>,
    translator: Option<Arc<Translator>>,
    activity: ActivityLog,
}

impl EventTrigger {
    pub fn new(
        registry: Arc<ReceiverRegistry>,
        queue: Arc<DurableQueue>,
        translator: Option<Arc<Translator>>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            registry,
            queue,
            translator,
            activity,
        }
    }

    /// A post moved between statuses.
    ///
    /// Entering `publish` sends the post; leaving it propagates the new
    /// status. Other transitions are ignored. Returns the queued job id.
    pub fn on_status_transition(
        &self,
        post: PostPayload,
        old_status: &str,
        new_status: &str,
        selected: &[usize],
    ) -> Result<Option<i64>> {
        if new_status == PUBLISH && old_status != PUBLISH {
            return self.send(post, selected);
        }
        if old_status == PUBLISH && new_status != PUBLISH {
            let update = StatusUpdate {
                post_id: post.post_id,
                status: normalize_post_status(new_status).to_string(),
            };
            return self.submit(JobAction::UpdateStatus(update), selected);
        }
        Ok(None)
    }

    /// An existing post was saved. Only published posts are re-sent.
    pub fn on_saved(&self, post: PostPayload, selected: &[usize]) -> Result<Option<i64>> {
        if post.status != PUBLISH {
            tracing::debug!(post_id = post.post_id, status = %post.status, "Ignoring save of unpublished post");
            return Ok(None);
        }
        self.send(post, selected)
    }

    /// A post is being deleted.
    pub fn on_deleted(&self, post_id: i64, selected: &[usize]) -> Result<Option<i64>> {
        self.submit(JobAction::Delete(DeleteRequest::new(post_id)), selected)
    }

    /// Queue an action directly, bypassing lifecycle rules.
    pub fn submit(&self, action: JobAction, selected: &[usize]) -> Result<Option<i64>> {
        let post_id = action.post_id();
        let Some(receivers) = self.select(post_id, action.kind().as_str(), selected)? else {
            return Ok(None);
        };

        let action = match action {
            JobAction::Send(post) => JobAction::Send(self.prepare(post)?),
            other => other,
        };

        let id = self.queue.enqueue_job(&action, &receivers, post_id)?;
        self.activity.info(
            "Replication job queued",
            json!({
                "job_id": id,
                "post_id": post_id,
                "action": action.kind().as_str(),
                "receivers_count": receivers.len(),
            }),
        );
        Ok(Some(id))
    }

    fn send(&self, post: PostPayload, selected: &[usize]) -> Result<Option<i64>> {
        self.submit(JobAction::Send(post), selected)
    }

    fn select(
        &self,
        post_id: i64,
        action: &str,
        selected: &[usize],
    ) -> Result<Option<Vec<ReceiverSnapshot>>> {
        let receivers = self.registry.snapshot(selected)?;
        if receivers.is_empty() {
            self.activity.info(
                "No receivers selected",
                json!({ "post_id": post_id, "action": action }),
            );
            return Ok(None);
        }
        Ok(Some(receivers))
    }

    /// Validate a post, normalise its status and translate its text.
    fn prepare(&self, mut post: PostPayload) -> Result<PostPayload> {
        validate_post(&post)?;
        post.status = normalize_post_status(&post.status).to_string();

        if let Some(translator) = self.translator.as_deref().filter(|t| t.is_active()) {
            post.title = translator.translate(&post.title, TranslationContext::Title);
            post.content = translator.translate(&post.content, TranslationContext::Body);
            post.excerpt = translator.translate(&post.excerpt, TranslationContext::Default);
            if post.title.trim().is_empty() {
                return Err(Error::Payload("translated title is empty".to_string()));
            }
        }
        Ok(post)
    }
}
