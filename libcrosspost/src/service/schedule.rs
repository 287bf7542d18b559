//! Post lifecycle and scheduling operations
//!
//! Creating or updating a schedule always runs preflight. A post whose
//! platforms are all ready becomes `scheduled` and is handed to the queue;
//! otherwise it is `scheduled_pending` with the blocking issues recorded on
//! it. Readiness gaps never raise errors, they only hold back the enqueue.
//!
//! The post row is written before the queue is touched. When the queue is
//! missing or down the post stays `scheduled` without a job id, and
//! [`ScheduleService::enqueue_pending`] picks it up later.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{CrosspostError, QueueError, Result};
use crate::preflight::Preflight;
use crate::queue::{publish_key, EnqueueRequest, JobState, QueueCapability};
use crate::types::{
    JobLog, LogLevel, MediaRef, PlatformTarget, Post, PostOptions, PostStatus, PreflightResult,
    Provider,
};

/// Create (no `postId`) or update a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    #[serde(default)]
    pub post_id: Option<String>,
    pub owner_id: String,
    pub caption: String,
    #[serde(default)]
    pub media: Option<MediaRef>,
    pub scheduled_at: DateTime<Utc>,
    pub platforms: Vec<PlatformTarget>,
    #[serde(flatten)]
    pub options: PostOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub platforms: Vec<PlatformTarget>,
}

/// Create or update a draft; nothing is validated or queued
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    #[serde(default)]
    pub post_id: Option<String>,
    pub owner_id: String,
    pub caption: String,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub platforms: Vec<PlatformTarget>,
    #[serde(flatten)]
    pub options: PostOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub id: String,
    pub status: PostStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub platforms: Vec<PlatformTarget>,
    pub issues: Vec<PreflightResult>,
    pub job_id: Option<String>,
}

impl From<&Post> for ScheduleResponse {
    fn from(post: &Post) -> Self {
        Self {
            id: post.id.clone(),
            status: post.status,
            scheduled_at: post
                .scheduled_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            platforms: post.platforms.clone(),
            issues: post.preflight_issues.clone().unwrap_or_default(),
            job_id: post.job_id.clone(),
        }
    }
}

/// Caption length against one platform's limit. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterCount {
    pub provider: Provider,
    pub count: usize,
    pub limit: usize,
    pub within_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDetail {
    pub id: String,
    pub owner_id: String,
    pub status: PostStatus,
    pub caption: String,
    pub media: Vec<MediaRef>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub platforms: Vec<PlatformTarget>,
    pub character_counts: Vec<CharacterCount>,
    pub last_error: Option<String>,
    pub issues: Vec<PreflightResult>,
    pub tone: Option<String>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub job_id: Option<String>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The pending job was cancelled and the post is a draft again
    Cancelled,
    /// A worker already holds the job; it will run to completion
    InFlight,
}

fn validate_platforms(platforms: &[PlatformTarget]) -> Result<()> {
    if platforms.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "At least one platform is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for target in platforms {
        if !seen.insert(target.provider) {
            return Err(CrosspostError::InvalidInput(format!(
                "Platform {} listed more than once",
                target.provider
            )));
        }
    }
    Ok(())
}

fn enqueue_request(post_id: &str, scheduled_at: i64, key: String) -> EnqueueRequest {
    EnqueueRequest {
        key,
        post_id: post_id.to_string(),
        payload: json!({ "postId": post_id, "scheduledAt": scheduled_at }),
        run_at_ms: scheduled_at.saturating_mul(1000),
    }
}

#[derive(Clone)]
pub struct ScheduleService {
    db: Database,
    preflight: Preflight,
    queue: QueueCapability,
}

impl ScheduleService {
    pub fn new(db: Database, queue: QueueCapability) -> Self {
        Self {
            preflight: Preflight::new(db.clone()),
            db,
            queue,
        }
    }

    pub fn queue(&self) -> &QueueCapability {
        &self.queue
    }

    /// Create a schedule, or update the one named by `post_id`
    pub async fn upsert(&self, request: ScheduleRequest) -> Result<ScheduleResponse> {
        let now = Utc::now();
        if request.scheduled_at <= now {
            return Err(CrosspostError::InvalidInput(format!(
                "scheduledAt must be in the future (got {})",
                request.scheduled_at.to_rfc3339()
            )));
        }
        validate_platforms(&request.platforms)?;

        let scheduled_at = request.scheduled_at.timestamp();
        match request.post_id.clone() {
            None => self.create_schedule(request, scheduled_at).await,
            Some(post_id) => self.reschedule(&post_id, request, scheduled_at).await,
        }
    }

    async fn create_schedule(
        &self,
        request: ScheduleRequest,
        scheduled_at: i64,
    ) -> Result<ScheduleResponse> {
        let mut post = Post::new_draft(request.owner_id, request.caption);
        post.media = request.media;
        post.platforms = request.platforms;
        post.options = request.options;
        post.scheduled_at = Some(scheduled_at);

        let results = self.preflight.check(&post.owner_id, &post.platforms).await?;
        let ready = post.apply_preflight(results);

        self.db.create_post(&post).await?;
        info!(post_id = %post.id, status = %post.status, scheduled_at, "Created schedule");
        self.record_preflight(&post).await?;

        if ready {
            let key = publish_key(&post.id, None);
            self.enqueue(&mut post, key).await?;
        }

        Ok(ScheduleResponse::from(&post))
    }

    async fn reschedule(
        &self,
        post_id: &str,
        request: ScheduleRequest,
        scheduled_at: i64,
    ) -> Result<ScheduleResponse> {
        let mut post = self.owned_post(post_id, &request.owner_id).await?;
        let previous_at = post.scheduled_at;
        let moved = previous_at != Some(scheduled_at);
        let job_state = self.job_state(&post).await;

        if job_state == Some(JobState::Active) {
            // The in-flight publish wins; only the new time is kept
            post.scheduled_at = Some(scheduled_at);
            self.db.update_post(&mut post).await?;
            warn!(post_id = %post.id, "Rescheduled while a publish is in flight");
            self.log(
                &post.id,
                LogLevel::Warn,
                "Rescheduled while publishing; the in-flight publish was not cancelled",
                Some(json!({ "scheduledAt": scheduled_at, "jobId": post.job_id })),
            )
            .await?;
            return Ok(ScheduleResponse::from(&post));
        }

        let fresh_cycle = post.status.is_terminal()
            || matches!(job_state, Some(JobState::Completed | JobState::Failed));

        post.caption = request.caption;
        post.media = request.media;
        post.platforms = request.platforms;
        post.options = request.options;
        post.scheduled_at = Some(scheduled_at);

        let results = self.preflight.check(&post.owner_id, &post.platforms).await?;
        let ready = post.apply_preflight(results);

        if fresh_cycle {
            post.external_id = None;
            post.external_url = None;
            self.db.clear_publish_records(&post.id).await?;
        }

        // A pending job survives only if neither its time nor readiness changed
        let pending = job_state.is_some_and(|s| s.is_pending());
        if !(ready && !moved && pending) {
            if let Some(old_job) = post.job_id.take() {
                if pending {
                    self.cancel_job(&post.id, &old_job).await;
                }
            }
        }

        self.db.update_post(&mut post).await?;
        info!(post_id = %post.id, status = %post.status, scheduled_at, "Updated schedule");
        self.record_preflight(&post).await?;

        if ready && post.job_id.is_none() {
            let rescheduled = fresh_cycle || previous_at.is_some_and(|at| at != scheduled_at);
            let key = publish_key(&post.id, rescheduled.then_some(scheduled_at));
            self.enqueue(&mut post, key).await?;
        }

        Ok(ScheduleResponse::from(&post))
    }

    /// Re-run preflight on a `scheduled_pending` post with a new platform list
    pub async fn resolve(
        &self,
        post_id: &str,
        request: ResolveRequest,
    ) -> Result<ScheduleResponse> {
        let mut post = self.db.require_post(post_id).await?;
        if post.status != PostStatus::ScheduledPending {
            return Err(CrosspostError::InvalidInput(format!(
                "Post {} is {}; only scheduled_pending posts can be resolved",
                post.id, post.status
            )));
        }
        validate_platforms(&request.platforms)?;

        post.platforms = request.platforms;
        let results = self.preflight.check(&post.owner_id, &post.platforms).await?;
        let ready = post.apply_preflight(results);

        self.db.update_post(&mut post).await?;
        info!(post_id = %post.id, status = %post.status, "Resolved schedule");
        self.record_preflight(&post).await?;

        if ready {
            let key = publish_key(&post.id, None);
            self.enqueue(&mut post, key).await?;
        }

        Ok(ScheduleResponse::from(&post))
    }

    pub async fn detail(&self, post_id: &str) -> Result<PostDetail> {
        let post = self.db.require_post(post_id).await?;
        let last_error = self
            .db
            .last_log_at_level(&post.id, LogLevel::Error)
            .await?
            .map(|log| log.message);

        let count = post.caption_length();
        let character_counts = post
            .platforms
            .iter()
            .map(|t| {
                let limit = t.provider.character_limit();
                CharacterCount {
                    provider: t.provider,
                    count,
                    limit,
                    within_limit: count <= limit,
                }
            })
            .collect();

        Ok(PostDetail {
            id: post.id.clone(),
            owner_id: post.owner_id.clone(),
            status: post.status,
            caption: post.caption.clone(),
            media: post.media.clone().into_iter().collect(),
            scheduled_at: post
                .scheduled_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            platforms: post.platforms.clone(),
            character_counts,
            last_error,
            issues: post.preflight_issues.clone().unwrap_or_default(),
            tone: post.options.tone.clone(),
            language: post.options.language.clone(),
            category: post.options.category.clone(),
            job_id: post.job_id.clone(),
            external_id: post.external_id.clone(),
            external_url: post.external_url.clone(),
        })
    }

    /// Copy content and platforms into a fresh draft with no schedule or job
    pub async fn duplicate(&self, post_id: &str) -> Result<ScheduleResponse> {
        let source = self.db.require_post(post_id).await?;

        let mut copy = Post::new_draft(source.owner_id.clone(), source.caption.clone());
        copy.media = source.media.clone();
        copy.platforms = source.platforms.clone();
        copy.options = source.options.clone();

        self.db.create_post(&copy).await?;
        self.log(
            &copy.id,
            LogLevel::Info,
            format!("Duplicated from {}", source.id),
            None,
        )
        .await?;
        info!(post_id = %copy.id, source = %source.id, "Duplicated post");

        Ok(ScheduleResponse::from(&copy))
    }

    pub async fn save_draft(&self, request: DraftRequest) -> Result<ScheduleResponse> {
        if !request.platforms.is_empty() {
            validate_platforms(&request.platforms)?;
        }

        let post = match &request.post_id {
            Some(post_id) => {
                let mut post = self.owned_post(post_id, &request.owner_id).await?;
                if post.status != PostStatus::Draft {
                    return Err(CrosspostError::InvalidInput(format!(
                        "Post {} is {}, not a draft",
                        post.id, post.status
                    )));
                }
                post.caption = request.caption;
                post.media = request.media;
                post.platforms = request.platforms;
                post.options = request.options;
                self.db.update_post(&mut post).await?;
                post
            }
            None => {
                let mut post = Post::new_draft(request.owner_id, request.caption);
                post.media = request.media;
                post.platforms = request.platforms;
                post.options = request.options;
                self.db.create_post(&post).await?;
                post
            }
        };

        debug!(post_id = %post.id, "Saved draft");
        Ok(ScheduleResponse::from(&post))
    }

    /// Withdraw a schedule, returning the post to `draft`.
    ///
    /// A job a worker has already picked up cannot be stopped; the post is
    /// left alone and [`CancelOutcome::InFlight`] is returned.
    pub async fn cancel(&self, post_id: &str) -> Result<CancelOutcome> {
        let mut post = self.db.require_post(post_id).await?;

        if !matches!(
            post.status,
            PostStatus::Scheduled | PostStatus::ScheduledPending | PostStatus::Queued
        ) {
            return Err(CrosspostError::InvalidInput(format!(
                "Post {} is {}; there is no schedule to cancel",
                post.id, post.status
            )));
        }

        if let Some(job_id) = post.job_id.clone() {
            let queue = self.queue.ready().await?;
            match queue.state(&job_id).await? {
                Some(JobState::Active) => {
                    info!(post_id = %post.id, job_id = %job_id, "Cancel requested for an in-flight publish");
                    return Ok(CancelOutcome::InFlight);
                }
                Some(state) if state.is_pending() => {
                    if !queue.cancel(&job_id).await? {
                        // Picked up between the state check and the cancel
                        return Ok(CancelOutcome::InFlight);
                    }
                }
                _ => {}
            }
        }

        post.job_id = None;
        post.scheduled_at = None;
        post.set_status(PostStatus::Draft);
        post.preflight_issues = Some(Vec::new());
        self.db.update_post(&mut post).await?;
        self.log(&post.id, LogLevel::Info, "Schedule cancelled", None)
            .await?;
        info!(post_id = %post.id, "Cancelled schedule");

        Ok(CancelOutcome::Cancelled)
    }

    /// Enqueue `scheduled` posts that never reached the queue.
    ///
    /// Returns how many were enqueued. Safe to run repeatedly: job keys are
    /// idempotent and posts that already have a job are not selected.
    pub async fn enqueue_pending(&self, limit: usize) -> Result<usize> {
        if self.queue.ready().await.is_err() {
            return Ok(0);
        }

        let mut enqueued = 0;
        for mut post in self.db.posts_awaiting_enqueue(limit).await? {
            let key = publish_key(&post.id, None);
            match self.enqueue(&mut post, key).await {
                Ok(()) if post.job_id.is_some() => enqueued += 1,
                Ok(()) => {}
                Err(e) if e.is_stale_write() => {
                    debug!(post_id = %post.id, "Post changed during sweep, leaving it for next pass");
                }
                Err(e) => return Err(e),
            }
        }

        if enqueued > 0 {
            info!(count = enqueued, "Enqueued posts awaiting the queue");
        }
        Ok(enqueued)
    }

    pub async fn list(
        &self,
        owner_id: Option<&str>,
        status: Option<PostStatus>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        self.db.list_posts(owner_id, status, limit).await
    }

    /// The post's job log, oldest first
    pub async fn logs(&self, post_id: &str) -> Result<Vec<JobLog>> {
        if !self.db.post_exists(post_id).await? {
            return Err(CrosspostError::NotFound(format!("post {}", post_id)));
        }
        self.db.get_logs(post_id).await
    }

    async fn owned_post(&self, post_id: &str, owner_id: &str) -> Result<Post> {
        let post = self.db.require_post(post_id).await?;
        if post.owner_id != owner_id {
            return Err(CrosspostError::NotFound(format!("post {}", post_id)));
        }
        Ok(post)
    }

    /// State of the post's current job, if the queue can tell us
    async fn job_state(&self, post: &Post) -> Option<JobState> {
        let job_id = post.job_id.as_deref()?;
        let queue = self.queue.queue()?;
        match queue.state(job_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(post_id = %post.id, job_id, error = %e, "Could not read job state");
                None
            }
        }
    }

    async fn cancel_job(&self, post_id: &str, job_id: &str) {
        let Some(queue) = self.queue.queue() else {
            return;
        };
        match queue.cancel(job_id).await {
            Ok(true) => debug!(post_id, job_id, "Cancelled superseded job"),
            // Lost the race to a worker; it will find the job superseded
            Ok(false) => debug!(post_id, job_id, "Superseded job already started"),
            Err(e) => warn!(post_id, job_id, error = %e, "Could not cancel superseded job"),
        }
    }

    /// Hand a ready post to the queue and remember the job id.
    ///
    /// Queue trouble is logged and swallowed: the post stays `scheduled`
    /// with no job id until the next sweep.
    async fn enqueue(&self, post: &mut Post, key: String) -> Result<()> {
        let Some(scheduled_at) = post.scheduled_at else {
            return Err(CrosspostError::InvalidInput(format!(
                "Post {} has no scheduledAt",
                post.id
            )));
        };

        let submitted = match self.queue.ready().await {
            Ok(queue) => {
                let first = queue
                    .enqueue(enqueue_request(&post.id, scheduled_at, key))
                    .await;
                match first {
                    // The key belongs to a finished cycle; use the time-scoped key
                    Ok(job) if job.state.is_terminal() => {
                        queue
                            .enqueue(enqueue_request(
                                &post.id,
                                scheduled_at,
                                publish_key(&post.id, Some(scheduled_at)),
                            ))
                            .await
                    }
                    other => other,
                }
            }
            Err(e) => Err(e),
        };

        let job = match submitted {
            Ok(job) => job,
            Err(e) => {
                self.awaiting_enqueue(post, &e).await?;
                return Ok(());
            }
        };

        post.job_id = Some(job.id.clone());
        self.db.update_post(post).await?;

        let delay_secs = (scheduled_at - Utc::now().timestamp()).max(0);
        info!(post_id = %post.id, job_id = %job.id, delay_secs, "Enqueued publish job");
        self.log(
            &post.id,
            LogLevel::Info,
            format!("Queued for publishing in {}s", delay_secs),
            Some(json!({ "jobId": job.id, "key": job.key })),
        )
        .await?;

        Ok(())
    }

    async fn awaiting_enqueue(&self, post: &Post, error: &QueueError) -> Result<()> {
        warn!(post_id = %post.id, error = %error, "Queue unavailable, post is awaiting enqueue");
        self.log(
            &post.id,
            LogLevel::Warn,
            format!("Queue unavailable, awaiting enqueue: {}", error),
            None,
        )
        .await
    }

    async fn record_preflight(&self, post: &Post) -> Result<()> {
        let Some(issues) = post.preflight_issues.as_ref().filter(|i| !i.is_empty()) else {
            return Ok(());
        };
        let summary = issues
            .iter()
            .flat_map(|r| r.issues.iter().cloned())
            .collect::<Vec<_>>()
            .join("; ");
        self.log(
            &post.id,
            LogLevel::Warn,
            format!("Preflight blocked: {}", summary),
            Some(json!({ "issues": issues })),
        )
        .await
    }

    async fn log(
        &self,
        post_id: &str,
        level: LogLevel,
        message: impl Into<String>,
        raw: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut entry = JobLog::new(post_id, level, message);
        entry.raw = raw;
        self.db.append_log(&entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobQueue, MemoryQueue, RetryPolicy};
    use crate::types::Connection;
    use std::sync::Arc;

    async fn setup() -> (ScheduleService, Database, Arc<MemoryQueue>) {
        let db = Database::in_memory().await.unwrap();
        let queue = Arc::new(MemoryQueue::new(RetryPolicy::default()));
        let service = ScheduleService::new(db.clone(), QueueCapability::available(queue.clone()));
        (service, db, queue)
    }

    async fn connect(db: &Database, provider: Provider) {
        db.upsert_connection(&Connection {
            id: format!("conn-{}", provider),
            owner_id: "owner-1".to_string(),
            provider,
            access_token: "sealed".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();
    }

    fn request(platforms: Vec<PlatformTarget>, in_secs: i64) -> ScheduleRequest {
        ScheduleRequest {
            post_id: None,
            owner_id: "owner-1".to_string(),
            caption: "Hello world".to_string(),
            media: None,
            scheduled_at: Utc::now() + chrono::Duration::seconds(in_secs),
            platforms,
            options: PostOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_past_schedule_rejected_without_persisting() {
        let (service, db, _queue) = setup().await;
        let err = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], -10))
            .await
            .unwrap_err();
        assert!(matches!(err, CrosspostError::InvalidInput(_)));
        assert_eq!(err.exit_code(), 3);
        assert!(db.list_posts(None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_platforms_rejected() {
        let (service, _db, _queue) = setup().await;
        assert!(service.upsert(request(vec![], 3600)).await.is_err());
        assert!(service
            .upsert(request(
                vec![
                    PlatformTarget::new(Provider::Twitter),
                    PlatformTarget::new(Provider::Twitter)
                ],
                3600
            ))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ready_post_is_scheduled_and_enqueued() {
        let (service, db, queue) = setup().await;
        connect(&db, Provider::Twitter).await;

        let response = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();

        assert_eq!(response.status, PostStatus::Scheduled);
        assert!(response.issues.is_empty());
        let job_id = response.job_id.unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.key, format!("publish:{}", response.id));
        assert_eq!(job.state, JobState::Delayed);

        let stored = db.require_post(&response.id).await.unwrap();
        assert!(stored.preflight_issues.is_none());
    }

    #[tokio::test]
    async fn test_pending_post_records_issues_and_skips_queue() {
        let (service, db, queue) = setup().await;
        let response = service
            .upsert(request(vec![PlatformTarget::new(Provider::Pinterest)], 3600))
            .await
            .unwrap();

        assert_eq!(response.status, PostStatus::ScheduledPending);
        assert_eq!(response.issues.len(), 1);
        assert!(response.job_id.is_none());
        assert!(queue.is_empty().await);

        let logs = db.get_logs(&response.id).await.unwrap();
        assert_eq!(logs[0].level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_unavailable_queue_leaves_post_awaiting_enqueue() {
        let db = Database::in_memory().await.unwrap();
        connect(&db, Provider::Twitter).await;
        let service = ScheduleService::new(db.clone(), QueueCapability::unavailable("down"));

        let response = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();
        assert_eq!(response.status, PostStatus::Scheduled);
        assert!(response.job_id.is_none());

        let awaiting = db.posts_awaiting_enqueue(10).await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(service.enqueue_pending(10).await.unwrap(), 0);

        // Queue comes back
        let queue = Arc::new(MemoryQueue::default());
        let service = ScheduleService::new(db.clone(), QueueCapability::available(queue.clone()));
        assert_eq!(service.enqueue_pending(10).await.unwrap(), 1);
        assert_eq!(service.enqueue_pending(10).await.unwrap(), 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_reschedule_pending_job_issues_new_key() {
        let (service, db, queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let first = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();
        let old_job = first.job_id.clone().unwrap();

        let mut update = request(vec![PlatformTarget::new(Provider::Twitter)], 7200);
        update.post_id = Some(first.id.clone());
        let second = service.upsert(update.clone()).await.unwrap();

        let new_job = second.job_id.unwrap();
        assert_ne!(new_job, old_job);
        assert_eq!(queue.state(&old_job).await.unwrap(), Some(JobState::Cancelled));
        let job = queue.get(&new_job).await.unwrap().unwrap();
        assert_eq!(
            job.key,
            format!("publish:{}:{}", first.id, update.scheduled_at.timestamp())
        );
    }

    #[tokio::test]
    async fn test_reschedule_while_active_keeps_job() {
        let (service, db, queue) = setup().await;
        connect(&db, Provider::Twitter).await;

        let mut create = request(vec![PlatformTarget::new(Provider::Twitter)], 1);
        create.scheduled_at = Utc::now() + chrono::Duration::seconds(1);
        let first = service.upsert(create).await.unwrap();
        let job_id = first.job_id.clone().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let leased = queue.lease().await.unwrap().unwrap();
        assert_eq!(leased.id, job_id);

        let mut update = request(vec![PlatformTarget::new(Provider::Twitter)], 7200);
        update.post_id = Some(first.id.clone());
        let second = service.upsert(update.clone()).await.unwrap();

        assert_eq!(second.job_id.as_deref(), Some(job_id.as_str()));
        assert_eq!(queue.state(&job_id).await.unwrap(), Some(JobState::Active));
        assert_eq!(queue.len().await, 1);

        let stored = db.require_post(&first.id).await.unwrap();
        assert_eq!(stored.scheduled_at, Some(update.scheduled_at.timestamp()));
        let logs = db.get_logs(&first.id).await.unwrap();
        assert_eq!(logs.last().unwrap().level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_update_without_changes_keeps_job() {
        let (service, db, queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let create = request(vec![PlatformTarget::new(Provider::Twitter)], 3600);
        let first = service.upsert(create.clone()).await.unwrap();

        let mut update = create;
        update.post_id = Some(first.id.clone());
        update.caption = "Edited".to_string();
        let second = service.upsert(update).await.unwrap();

        assert_eq!(second.job_id, first.job_id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_other_owner_cannot_update() {
        let (service, db, _queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let first = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();

        let mut update = request(vec![PlatformTarget::new(Provider::Twitter)], 7200);
        update.post_id = Some(first.id);
        update.owner_id = "intruder".to_string();
        assert!(matches!(
            service.upsert(update).await,
            Err(CrosspostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_only_pending_posts() {
        let (service, db, _queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let scheduled = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();

        let err = service
            .resolve(
                &scheduled.id,
                ResolveRequest {
                    platforms: vec![PlatformTarget::new(Provider::Twitter)],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrosspostError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resolve_still_not_ready_stays_pending() {
        let (service, _db, _queue) = setup().await;
        let pending = service
            .upsert(request(vec![PlatformTarget::new(Provider::Pinterest)], 3600))
            .await
            .unwrap();

        let resolved = service
            .resolve(
                &pending.id,
                ResolveRequest {
                    platforms: vec![PlatformTarget::with_board(Provider::Pinterest, "123")],
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, PostStatus::ScheduledPending);
        assert_eq!(
            resolved.issues[0].issues,
            vec!["No pinterest connection found"]
        );
    }

    #[tokio::test]
    async fn test_detail() {
        let (service, db, _queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let mut create = request(
            vec![
                PlatformTarget::new(Provider::Twitter),
                PlatformTarget::new(Provider::Pinterest),
            ],
            3600,
        );
        create.caption = "x".repeat(300);
        create.options.tone = Some("playful".to_string());
        let response = service.upsert(create).await.unwrap();

        db.append_log(&JobLog::new(&response.id, LogLevel::Error, "first"))
            .await
            .unwrap();
        db.append_log(&JobLog::new(&response.id, LogLevel::Error, "second"))
            .await
            .unwrap();

        let detail = service.detail(&response.id).await.unwrap();
        assert_eq!(detail.last_error.as_deref(), Some("second"));
        assert_eq!(detail.tone.as_deref(), Some("playful"));
        assert!(detail.media.is_empty());
        assert_eq!(detail.character_counts.len(), 2);
        assert_eq!(detail.character_counts[0].limit, 280);
        assert!(!detail.character_counts[0].within_limit);
        assert_eq!(detail.character_counts[1].limit, 500);
        assert!(detail.character_counts[1].within_limit);
        assert_eq!(detail.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_makes_clean_draft() {
        let (service, db, _queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let original = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();

        let copy = service.duplicate(&original.id).await.unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.status, PostStatus::Draft);
        assert!(copy.scheduled_at.is_none());
        assert!(copy.job_id.is_none());
        assert_eq!(copy.platforms, original.platforms);

        let stored = db.require_post(&copy.id).await.unwrap();
        assert_eq!(stored.caption, "Hello world");
        assert_eq!(stored.preflight_issues, Some(vec![]));
    }

    #[tokio::test]
    async fn test_cancel_returns_post_to_draft() {
        let (service, db, queue) = setup().await;
        connect(&db, Provider::Twitter).await;
        let scheduled = service
            .upsert(request(vec![PlatformTarget::new(Provider::Twitter)], 3600))
            .await
            .unwrap();
        let job_id = scheduled.job_id.unwrap();

        assert_eq!(
            service.cancel(&scheduled.id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(queue.state(&job_id).await.unwrap(), Some(JobState::Cancelled));

        let stored = db.require_post(&scheduled.id).await.unwrap();
        assert_eq!(stored.status, PostStatus::Draft);
        assert!(stored.job_id.is_none());
        assert_eq!(stored.preflight_issues, Some(vec![]));

        // Nothing left to cancel
        assert!(service.cancel(&scheduled.id).await.is_err());
    }

    #[tokio::test]
    async fn test_drafts() {
        let (service, _db, _queue) = setup().await;
        let draft = service
            .save_draft(DraftRequest {
                post_id: None,
                owner_id: "owner-1".to_string(),
                caption: "idea".to_string(),
                media: None,
                platforms: vec![],
                options: PostOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(draft.status, PostStatus::Draft);

        let updated = service
            .save_draft(DraftRequest {
                post_id: Some(draft.id.clone()),
                owner_id: "owner-1".to_string(),
                caption: "better idea".to_string(),
                media: None,
                platforms: vec![PlatformTarget::new(Provider::Linkedin)],
                options: PostOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(updated.id, draft.id);
        assert_eq!(updated.platforms.len(), 1);
    }

    #[tokio::test]
    async fn test_logs_for_missing_post() {
        let (service, _db, _queue) = setup().await;
        assert!(matches!(
            service.logs("missing").await,
            Err(CrosspostError::NotFound(_))
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let request: ScheduleRequest = serde_json::from_value(json!({
            "ownerId": "owner-1",
            "caption": "Hello world",
            "scheduledAt": "2030-01-02T03:04:05Z",
            "platforms": [{"provider": "pinterest", "boardId": "123"}],
            "tone": "formal"
        }))
        .unwrap();
        assert!(request.post_id.is_none());
        assert_eq!(request.platforms[0].board_id.as_deref(), Some("123"));
        assert_eq!(request.options.tone.as_deref(), Some("formal"));
        assert_eq!(request.scheduled_at.timestamp(), 1_893_553_445);
    }
}
