//! Delayed, retryable, idempotent publish jobs
//!
//! Two interchangeable backends implement [`JobQueue`]:
//!
//! - [`SqliteQueue`]: durable, shares the application database.
//! - [`MemoryQueue`]: non-durable and single-process only. Jobs vanish on
//!   restart and are invisible to other instances.
//!
//! Callers never assume a queue exists. They receive a [`QueueCapability`]
//! and branch on availability.
//!
//! Job lifecycle:
//! - `delayed` -> `waiting` (run time reached) -> `active` -> `completed`
//! - `active` -> `delayed` (retry with backoff) -> ... -> `failed`
//! - `waiting`/`delayed` -> `cancelled`

pub mod memory;
pub mod retry;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{QueueBackend, QueueConfig};
use crate::db::Database;
use crate::error::QueueError;

pub use memory::MemoryQueue;
pub use retry::RetryPolicy;
pub use sqlite::SqliteQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// Not yet picked up by a worker; the only states that may be cancelled
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored state for a fresh or retried job due at `run_at_ms`
pub(crate) fn pending_state(run_at_ms: i64, now_ms: i64) -> JobState {
    if run_at_ms > now_ms {
        JobState::Delayed
    } else {
        JobState::Waiting
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub key: String,
    pub post_id: String,
    pub payload: Value,
    pub state: JobState,
    /// Attempts started so far, including the current one while active
    pub attempts: u32,
    pub run_at_ms: i64,
    pub last_error: Option<String>,
}

impl Job {
    /// A delayed job whose run time has passed reports as waiting
    pub(crate) fn observed_at(mut self, now_ms: i64) -> Self {
        if self.state == JobState::Delayed && self.run_at_ms <= now_ms {
            self.state = JobState::Waiting;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Idempotency key; see [`publish_key`]
    pub key: String,
    pub post_id: String,
    pub payload: Value,
    /// Earliest run time, Unix milliseconds. Past values run immediately.
    pub run_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled
    Retry { run_at_ms: i64 },
    /// The attempt cap is reached; the job is now `failed`
    Exhausted,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &'static str;

    fn retry_policy(&self) -> &RetryPolicy;

    async fn is_available(&self) -> bool;

    /// Submit a job. An existing job with the same key is returned untouched,
    /// unless it was cancelled, in which case it is replaced.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    async fn state(&self, job_id: &str) -> Result<Option<JobState>, QueueError> {
        Ok(self.get(job_id).await?.map(|job| job.state))
    }

    /// Cancel a job that has not started. Returns false for active, finished
    /// or unknown jobs.
    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError>;

    /// Claim the earliest due job, marking it active and counting the attempt
    async fn lease(&self) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job_id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt and decide between retry and exhaustion
    async fn fail(&self, job_id: &str, error: &str) -> Result<FailOutcome, QueueError>;

    /// Run time of the earliest pending job, Unix milliseconds
    async fn next_due_at(&self) -> Result<Option<i64>, QueueError>;
}

/// A queue that may or may not be there
#[derive(Clone)]
pub enum QueueCapability {
    Available(Arc<dyn JobQueue>),
    Unavailable { reason: String },
}

impl fmt::Debug for QueueCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueCapability::Available(queue) => {
                f.debug_tuple("Available").field(&queue.name()).finish()
            }
            QueueCapability::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

impl QueueCapability {
    pub fn available(queue: Arc<dyn JobQueue>) -> Self {
        QueueCapability::Available(queue)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        QueueCapability::Unavailable {
            reason: reason.into(),
        }
    }

    /// Build the configured backend
    pub fn from_config(config: &QueueConfig, db: &Database) -> Self {
        let policy = RetryPolicy::from_config(config);
        match config.backend {
            QueueBackend::Sqlite => {
                Self::available(Arc::new(SqliteQueue::new(db.pool().clone(), policy)))
            }
            QueueBackend::Memory => Self::available(Arc::new(MemoryQueue::new(policy))),
            QueueBackend::Disabled => Self::unavailable("queue backend disabled in configuration"),
        }
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        match self {
            QueueCapability::Available(queue) => Some(queue),
            QueueCapability::Unavailable { .. } => None,
        }
    }

    /// The queue, if it is configured and currently answering
    pub async fn ready(&self) -> Result<&Arc<dyn JobQueue>, QueueError> {
        match self {
            QueueCapability::Available(queue) => {
                if queue.is_available().await {
                    Ok(queue)
                } else {
                    Err(QueueError::Unavailable(format!(
                        "{} backend is not responding",
                        queue.name()
                    )))
                }
            }
            QueueCapability::Unavailable { reason } => Err(QueueError::Unavailable(reason.clone())),
        }
    }
}

/// Idempotency key for a post's publish job.
///
/// The first schedule uses `publish:{post_id}`. A reschedule folds in the new
/// target time so it becomes a new logical job rather than a duplicate.
pub fn publish_key(post_id: &str, rescheduled_to: Option<i64>) -> String {
    match rescheduled_to {
        Some(ts) => format!("publish:{}:{}", post_id, ts),
        None => format!("publish:{}", post_id),
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_key() {
        assert_eq!(publish_key("abc", None), "publish:abc");
        assert_eq!(publish_key("abc", Some(1_700_000_000)), "publish:abc:1700000000");
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("paused"), None);
    }

    #[test]
    fn test_pending_states() {
        assert!(JobState::Waiting.is_pending());
        assert!(JobState::Delayed.is_pending());
        assert!(!JobState::Active.is_pending());
        assert!(!JobState::Completed.is_pending());
    }

    #[test]
    fn test_delayed_job_observed_as_waiting_once_due() {
        let job = Job {
            id: "j".to_string(),
            key: "publish:p".to_string(),
            post_id: "p".to_string(),
            payload: Value::Null,
            state: JobState::Delayed,
            attempts: 0,
            run_at_ms: 1_000,
            last_error: None,
        };
        assert_eq!(job.clone().observed_at(999).state, JobState::Delayed);
        assert_eq!(job.observed_at(1_000).state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_disabled_backend_is_unavailable() {
        let db = Database::in_memory().await.unwrap();
        let config = QueueConfig {
            backend: QueueBackend::Disabled,
            ..QueueConfig::default()
        };
        let capability = QueueCapability::from_config(&config, &db);
        assert!(capability.queue().is_none());
        assert!(matches!(
            capability.ready().await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_backend_is_available() {
        let db = Database::in_memory().await.unwrap();
        let config = QueueConfig {
            backend: QueueBackend::Memory,
            ..QueueConfig::default()
        };
        let capability = QueueCapability::from_config(&config, &db);
        assert_eq!(capability.ready().await.unwrap().name(), "memory");
    }
}
