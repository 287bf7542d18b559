//! In-memory queue backend.
//!
//! Non-durable: everything is lost when the process exits, and two processes
//! never see each other's jobs. Suitable for tests, demos and single-process
//! deployments that can afford to lose scheduled work on restart.
//!
//! Finished jobs (completed, failed, cancelled) are kept for a retention
//! window, then forgotten together with their idempotency key. After that
//! `state` reports them as unknown.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    now_ms, pending_state, EnqueueRequest, FailOutcome, Job, JobQueue, JobState, RetryPolicy,
};
use crate::error::QueueError;

/// Heap entry, earliest run time first.
///
/// Entries are never removed eagerly. A popped entry is skipped when its job
/// was cancelled or rescheduled since it was pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    run_at_ms: i64,
    seq: u64,
    job_id: String,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest entry; seq keeps FIFO order
        other
            .run_at_ms
            .cmp(&self.run_at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// How long finished jobs stay visible by default
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    by_key: HashMap<String, String>,
    schedule: BinaryHeap<Scheduled>,
    /// Finished jobs in the order they finished
    finished: VecDeque<(i64, String)>,
    next_seq: u64,
}

impl State {
    fn push(&mut self, job_id: &str, run_at_ms: i64) {
        self.next_seq += 1;
        self.schedule.push(Scheduled {
            run_at_ms,
            seq: self.next_seq,
            job_id: job_id.to_string(),
        });
    }

    fn is_live(&self, entry: &Scheduled) -> bool {
        self.jobs
            .get(&entry.job_id)
            .is_some_and(|job| job.state.is_pending() && job.run_at_ms == entry.run_at_ms)
    }

    fn finish(&mut self, job_id: &str, now: i64) {
        self.finished.push_back((now, job_id.to_string()));
    }

    /// Forget jobs that finished more than `retention_ms` ago
    fn evict(&mut self, now: i64, retention_ms: i64) {
        while let Some((finished_at, _)) = self.finished.front() {
            if finished_at.saturating_add(retention_ms) > now {
                break;
            }
            let Some((_, job_id)) = self.finished.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            if !job.state.is_terminal() {
                continue;
            }
            if self.by_key.get(&job.key) == Some(&job_id) {
                self.by_key.remove(&job.key);
            }
            self.jobs.remove(&job_id);
        }
    }

    /// Drop stale entries from the top of the heap
    fn prune(&mut self) {
        while let Some(top) = self.schedule.peek() {
            if self.is_live(top) {
                break;
            }
            self.schedule.pop();
        }
    }
}

pub struct MemoryQueue {
    state: Mutex<State>,
    policy: RetryPolicy,
    retention: Duration,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep finished jobs for `retention` instead of [`DEFAULT_RETENTION`]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn delay_ms(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError> {
        let now = now_ms();
        let mut state = self.state.lock().await;
        state.evict(now, delay_ms(self.retention));

        if let Some(existing_id) = state.by_key.get(&request.key).cloned() {
            let reusable = state
                .jobs
                .get(&existing_id)
                .filter(|job| job.state != JobState::Cancelled)
                .cloned();
            if let Some(job) = reusable {
                return Ok(job.observed_at(now));
            }
            // A cancelled job gives up its key
            state.jobs.remove(&existing_id);
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            key: request.key.clone(),
            post_id: request.post_id,
            payload: request.payload,
            state: pending_state(request.run_at_ms, now),
            attempts: 0,
            run_at_ms: request.run_at_ms,
            last_error: None,
        };

        state.by_key.insert(request.key, job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        state.push(&job.id, job.run_at_ms);

        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        let state = self.state.lock().await;
        Ok(state.jobs.get(job_id).cloned().map(|job| job.observed_at(now)))
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(job_id).filter(|job| job.state.is_pending()) else {
            return Ok(false);
        };
        job.state = JobState::Cancelled;
        state.finish(job_id, now_ms());
        Ok(true)
    }

    async fn lease(&self) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        let mut state = self.state.lock().await;
        state.evict(now, delay_ms(self.retention));
        state.prune();

        let due = matches!(state.schedule.peek(), Some(top) if top.run_at_ms <= now);
        if !due {
            return Ok(None);
        }

        let Some(entry) = state.schedule.pop() else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&entry.job_id) else {
            return Ok(None);
        };

        job.state = JobState::Active;
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if job.state != JobState::Completed {
            job.state = JobState::Completed;
            state.finish(job_id, now_ms());
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let now = now_ms();
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        job.last_error = Some(error.to_string());

        if self.policy.is_exhausted(job.attempts) {
            job.state = JobState::Failed;
            state.finish(job_id, now);
            return Ok(FailOutcome::Exhausted);
        }

        let run_at_ms = now.saturating_add(delay_ms(self.policy.next_delay(job.attempts)));
        job.run_at_ms = run_at_ms;
        job.state = pending_state(run_at_ms, now);
        let id = job.id.clone();
        state.push(&id, run_at_ms);

        Ok(FailOutcome::Retry { run_at_ms })
    }

    async fn next_due_at(&self) -> Result<Option<i64>, QueueError> {
        let mut state = self.state.lock().await;
        state.prune();
        Ok(state.schedule.peek().map(|entry| entry.run_at_ms))
    }
}
