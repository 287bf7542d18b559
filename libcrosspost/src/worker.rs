//! Publish executor
//!
//! [`PublishWorker`] runs one leased job end to end; [`WorkerGroup`] runs N of
//! them concurrently until asked to stop.
//!
//! Per job:
//! 1. post -> `queued`, emit `PublishStarted`
//! 2. post -> `publishing`
//! 3. for every platform without a publish record: load the connection, get a
//!    valid token, publish, record the receipt
//! 4. all platforms done: post -> `published`, info log, job complete
//! 5. otherwise: error log, then either retry (post back to `queued`) or, on
//!    the last allowed attempt, post -> `failed` and one `PublishFailed`
//!
//! Everything is written before the queue hears about the outcome. A job that
//! is already running is never interrupted; shutdown only stops new leases.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{CrosspostError, DbError, PlatformError, Result};
use crate::providers::{PublishReceipt, PublishRequest, ProviderRegistry};
use crate::queue::{now_ms, FailOutcome, Job, JobQueue};
use crate::service::events::{Event, EventBus};
use crate::tokens::TokenRefresher;
use crate::types::{JobLog, LogLevel, PlatformTarget, Post, PostStatus, PublishRecord};

/// Reload-and-reapply attempts when a status write loses a version race
const MAX_STALE_RETRIES: usize = 3;

/// What one `run_once` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing was due
    Idle,
    Published { post_id: String },
    Retrying { post_id: String, run_at_ms: i64 },
    Failed { post_id: String },
    /// The job no longer matches its post and was completed without publishing
    Skipped { post_id: String },
}

#[derive(Clone)]
pub struct PublishWorker {
    db: Database,
    queue: Arc<dyn JobQueue>,
    registry: ProviderRegistry,
    tokens: TokenRefresher,
    events: EventBus,
}

impl PublishWorker {
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        registry: ProviderRegistry,
        tokens: TokenRefresher,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            queue,
            registry,
            tokens,
            events,
        }
    }

    /// Lease and run at most one due job
    pub async fn run_once(&self) -> Result<JobOutcome> {
        let Some(job) = self.queue.lease().await? else {
            return Ok(JobOutcome::Idle);
        };

        match self.process(&job).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(job_id = %job.id, post_id = %job.post_id, error = %e, "Publish job aborted");
                self.abort(&job, &e).await;
                Err(e)
            }
        }
    }

    /// Treat an infrastructure failure as a failed attempt.
    ///
    /// The attempt goes back to the queue so the job never stays active, and
    /// the post follows the same rules as a provider failure: an error log per
    /// attempt, `failed` plus one `PublishFailed` once the queue gives up.
    /// Each step is best effort since the store that just failed may fail again.
    async fn abort(&self, job: &Job, cause: &CrosspostError) {
        let log = JobLog::new(
            &job.post_id,
            LogLevel::Error,
            format!("Attempt {} aborted: {}", job.attempts, cause),
        )
        .with_raw(json!({ "attempt": job.attempts, "error": cause.to_string() }));
        if let Err(e) = self.db.append_log(&log).await {
            error!(job_id = %job.id, error = %e, "Could not record aborted attempt");
        }

        let outcome = match self.queue.fail(&job.id, &cause.to_string()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Could not release aborted job");
                return;
            }
        };

        let next_status = match outcome {
            FailOutcome::Retry { .. } => PostStatus::Queued,
            FailOutcome::Exhausted => PostStatus::Failed,
        };
        match self
            .transition(&job.post_id, &job.id, |p| p.set_status(next_status))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                error!(post_id = %job.post_id, error = %e, "Could not update post after aborted attempt");
            }
        }

        if outcome == FailOutcome::Exhausted {
            error!(post_id = %job.post_id, attempts = job.attempts, "Publish failed permanently");
            self.events.emit(Event::PublishFailed {
                post_id: job.post_id.clone(),
                attempts: job.attempts,
                error: cause.to_string(),
            });
        }
    }

    /// Complete a job its post has moved away from, without publishing
    async fn superseded(&self, post_id: &str, job: &Job) -> Result<JobOutcome> {
        warn!(job_id = %job.id, post_id = %post_id, "Job superseded, skipping");
        self.queue.complete(&job.id).await?;
        Ok(JobOutcome::Skipped {
            post_id: post_id.to_string(),
        })
    }

    async fn process(&self, job: &Job) -> Result<JobOutcome> {
        let post_id = job.post_id.clone();

        let Some(post) = self.db.get_post(&post_id).await? else {
            warn!(job_id = %job.id, post_id = %post_id, "Job refers to a missing post");
            self.queue.complete(&job.id).await?;
            return Ok(JobOutcome::Skipped { post_id });
        };

        if post.job_id.as_deref() != Some(job.id.as_str()) || post.status == PostStatus::Published {
            return self.superseded(&post_id, job).await;
        }

        let Some(post) = self
            .transition(&post_id, &job.id, |p| p.set_status(PostStatus::Queued))
            .await?
        else {
            return self.superseded(&post_id, job).await;
        };

        self.events.emit(Event::PublishStarted {
            post_id: post_id.clone(),
            attempt: job.attempts,
            providers: post
                .platforms
                .iter()
                .map(|t| t.provider.to_string())
                .collect(),
        });
        info!(post_id = %post_id, job_id = %job.id, attempt = job.attempts, "Publishing post");

        let Some(post) = self
            .transition(&post_id, &job.id, |p| p.set_status(PostStatus::Publishing))
            .await?
        else {
            return self.superseded(&post_id, job).await;
        };

        let failures = self.publish_pending(&post).await?;

        if failures.is_empty() {
            self.finish_success(&post_id, job).await
        } else {
            self.finish_failure(&post_id, job, failures).await
        }
    }

    /// Publish to every platform not yet recorded; returns the failures
    async fn publish_pending(&self, post: &Post) -> Result<Vec<(PlatformTarget, CrosspostError)>> {
        let done: Vec<_> = self
            .db
            .get_publish_records(&post.id)
            .await?
            .into_iter()
            .map(|r| r.provider)
            .collect();

        let pending: Vec<&PlatformTarget> = post
            .platforms
            .iter()
            .filter(|t| !done.contains(&t.provider))
            .collect();

        if pending.len() < post.platforms.len() {
            debug!(
                post_id = %post.id,
                skipped = post.platforms.len() - pending.len(),
                "Skipping platforms published on an earlier attempt"
            );
        }

        let attempts = pending.iter().map(|target| async move {
            let result = self.publish_to(post, target).await;
            ((*target).clone(), result)
        });

        let mut failures = Vec::new();
        for (target, result) in join_all(attempts).await {
            match result {
                Ok(receipt) => {
                    info!(
                        post_id = %post.id,
                        provider = %target.provider,
                        external_id = %receipt.external_id,
                        "Published to platform"
                    );
                    self.db
                        .create_publish_record(&PublishRecord {
                            id: None,
                            post_id: post.id.clone(),
                            provider: target.provider,
                            external_id: receipt.external_id,
                            external_url: receipt.external_url,
                            published_at: chrono::Utc::now().timestamp(),
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(
                        post_id = %post.id,
                        provider = %target.provider,
                        error = %e,
                        "Platform publish failed"
                    );
                    failures.push((target, e));
                }
            }
        }

        Ok(failures)
    }

    async fn publish_to(&self, post: &Post, target: &PlatformTarget) -> Result<PublishReceipt> {
        let connection = self
            .db
            .get_connection(&post.owner_id, target.provider)
            .await?
            .ok_or_else(|| {
                PlatformError::Authentication(format!(
                    "No {} connection found",
                    target.provider.as_str()
                ))
            })?;

        let access_token = self.tokens.valid_access_token(&connection).await?;

        let publisher = self.registry.publisher(target.provider).ok_or_else(|| {
            PlatformError::NotConfigured(format!("no publisher for {}", target.provider))
        })?;

        let request = PublishRequest {
            access_token,
            caption: post.caption.clone(),
            media: post.media.clone(),
            board_id: target.board_id.clone(),
            options: post.options.clone(),
        };

        Ok(publisher.publish(&request).await?)
    }

    async fn finish_success(&self, post_id: &str, job: &Job) -> Result<JobOutcome> {
        let records = self.db.get_publish_records(post_id).await?;

        let Some(post) = self
            .transition(post_id, &job.id, |p| {
                // The first requested platform names the post
                let primary = p
                    .platforms
                    .iter()
                    .find_map(|t| records.iter().find(|r| r.provider == t.provider));
                if let Some(record) = primary {
                    p.external_id = Some(record.external_id.clone());
                    p.external_url = record.external_url.clone();
                }
                p.set_status(PostStatus::Published);
            })
            .await?
        else {
            return self.superseded(post_id, job).await;
        };

        let receipts: Vec<_> = records
            .iter()
            .map(|r| {
                json!({
                    "provider": r.provider,
                    "externalId": r.external_id,
                    "externalUrl": r.external_url,
                })
            })
            .collect();
        self.db
            .append_log(
                &JobLog::new(
                    post_id,
                    LogLevel::Info,
                    format!("Published to {} platform(s)", records.len()),
                )
                .with_raw(json!({ "attempt": job.attempts, "receipts": receipts })),
            )
            .await?;

        self.queue.complete(&job.id).await?;

        self.events.emit(Event::PublishSucceeded {
            post_id: post_id.to_string(),
            external_id: post.external_id.clone(),
            external_url: post.external_url.clone(),
        });
        info!(post_id = %post_id, job_id = %job.id, "Post published");

        Ok(JobOutcome::Published {
            post_id: post_id.to_string(),
        })
    }

    async fn finish_failure(
        &self,
        post_id: &str,
        job: &Job,
        failures: Vec<(PlatformTarget, CrosspostError)>,
    ) -> Result<JobOutcome> {
        let message = failures
            .iter()
            .map(|(target, e)| format!("{}: {}", target.provider, e))
            .collect::<Vec<_>>()
            .join("; ");
        let details: Vec<_> = failures
            .iter()
            .map(|(target, e)| json!({ "provider": target.provider, "error": e.to_string() }))
            .collect();

        self.db
            .append_log(
                &JobLog::new(
                    post_id,
                    LogLevel::Error,
                    format!("Attempt {} failed: {}", job.attempts, message),
                )
                .with_raw(json!({ "attempt": job.attempts, "errors": details })),
            )
            .await?;

        let last_attempt = self.queue.retry_policy().is_exhausted(job.attempts);
        let next_status = if last_attempt {
            PostStatus::Failed
        } else {
            PostStatus::Queued
        };
        if self
            .transition(post_id, &job.id, |p| p.set_status(next_status))
            .await?
            .is_none()
        {
            return self.superseded(post_id, job).await;
        }

        match self.queue.fail(&job.id, &message).await? {
            FailOutcome::Retry { run_at_ms } => {
                warn!(
                    post_id = %post_id,
                    attempt = job.attempts,
                    retry_in_ms = run_at_ms - now_ms(),
                    "Publish attempt failed, retrying"
                );
                self.events.emit(Event::PublishRetrying {
                    post_id: post_id.to_string(),
                    attempt: job.attempts,
                    retry_at_ms: run_at_ms,
                    error: message,
                });
                Ok(JobOutcome::Retrying {
                    post_id: post_id.to_string(),
                    run_at_ms,
                })
            }
            FailOutcome::Exhausted => {
                // Queue and worker disagree on the cap; the queue wins
                if !last_attempt
                    && self
                        .transition(post_id, &job.id, |p| p.set_status(PostStatus::Failed))
                        .await?
                        .is_none()
                {
                    return Ok(JobOutcome::Skipped {
                        post_id: post_id.to_string(),
                    });
                }
                error!(post_id = %post_id, attempts = job.attempts, "Publish failed permanently");
                self.events.emit(Event::PublishFailed {
                    post_id: post_id.to_string(),
                    attempts: job.attempts,
                    error: message,
                });
                Ok(JobOutcome::Failed {
                    post_id: post_id.to_string(),
                })
            }
        }
    }

    /// Load, apply, write; reload and reapply if another writer got there first.
    ///
    /// Returns `None` once the post no longer points at `job_id`: a reschedule
    /// won the race and its state must not be overwritten.
    async fn transition<F>(&self, post_id: &str, job_id: &str, apply: F) -> Result<Option<Post>>
    where
        F: Fn(&mut Post),
    {
        for _ in 0..MAX_STALE_RETRIES {
            let mut post = self.db.require_post(post_id).await?;
            if post.job_id.as_deref() != Some(job_id) {
                debug!(post_id = %post_id, job_id = %job_id, "Post no longer owned by job");
                return Ok(None);
            }
            apply(&mut post);
            match self.db.update_post(&mut post).await {
                Ok(()) => return Ok(Some(post)),
                Err(e) if e.is_stale_write() => {
                    debug!(post_id = %post_id, "Post changed underneath worker, reloading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DbError::StaleWrite(post_id.to_string()).into())
    }
}

/// Handle to a running pool of publish workers.
///
/// Dropping the group without calling [`shutdown_and_join`](Self::shutdown_and_join)
/// also stops the workers once their current job finishes.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers polling every `poll_interval` when idle
    pub fn spawn(n: usize, worker: PublishWorker, poll_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Arc::new(worker);

        let joins = (0..n.max(1))
            .map(|worker_id| {
                let worker = Arc::clone(&worker);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, worker, poll_interval, &mut rx).await;
                })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new leases; in-flight jobs run to completion
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for (worker_id, join) in self.joins.into_iter().enumerate() {
            if let Err(e) = join.await {
                error!(worker_id, error = %e, "Publish worker ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    worker: Arc<PublishWorker>,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "Publish worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match worker.run_once().await {
            Ok(JobOutcome::Idle) => true,
            Ok(_) => false,
            Err(e) => {
                error!(worker_id, error = %e, "Worker iteration failed");
                true
            }
        };

        if idle {
            let wait = idle_wait(&worker, poll_interval).await;
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // Sender gone means nobody can ask us to keep going
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
    debug!(worker_id, "Publish worker stopped");
}

/// Sleep until the next job is due, capped at the poll interval
async fn idle_wait(worker: &PublishWorker, poll_interval: Duration) -> Duration {
    match worker.queue.next_due_at().await {
        Ok(Some(due)) => {
            let until_due = u64::try_from(due - now_ms()).unwrap_or(0);
            poll_interval.min(Duration::from_millis(until_due.max(10)))
        }
        _ => poll_interval,
    }
}
