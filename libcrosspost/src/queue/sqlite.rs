//! Durable queue backend on the application's SQLite database

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::{
    now_ms, pending_state, EnqueueRequest, FailOutcome, Job, JobQueue, JobState, RetryPolicy,
};
use crate::error::QueueError;

const JOB_COLUMNS: &str =
    "id, idempotency_key, post_id, payload, state, attempts, run_at_ms, last_error";

pub struct SqliteQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let payload: String = row.get("payload");
    let state: String = row.get("state");
    let attempts: i64 = row.get("attempts");

    Ok(Job {
        id: row.get("id"),
        key: row.get("idempotency_key"),
        post_id: row.get("post_id"),
        payload: serde_json::from_str(&payload)?,
        // Unknown states only appear if someone edits the table by hand
        state: JobState::parse(&state).unwrap_or(JobState::Failed),
        attempts: u32::try_from(attempts).unwrap_or(0),
        run_at_ms: row.get("run_at_ms"),
        last_error: row.get("last_error"),
    })
}

fn delay_ms(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobQueue for SqliteQueue {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError> {
        let now = now_ms();
        let created_at = chrono::Utc::now().timestamp();
        let payload = serde_json::to_string(&request.payload)?;

        // A cancelled job gives up its key
        sqlx::query("DELETE FROM jobs WHERE idempotency_key = ? AND state = 'cancelled'")
            .bind(&request.key)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, idempotency_key, post_id, payload, state, attempts,
                              run_at_ms, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, NULL, ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&request.key)
        .bind(&request.post_id)
        .bind(payload)
        .bind(pending_state(request.run_at_ms, now).as_str())
        .bind(request.run_at_ms)
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE idempotency_key = ?",
            JOB_COLUMNS
        ))
        .bind(&request.key)
        .fetch_one(&self.pool)
        .await?;

        Ok(job_from_row(&row)?.observed_at(now))
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        Ok(self.fetch(job_id).await?.map(|job| job.observed_at(now)))
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', updated_at = ?
            WHERE id = ? AND state IN ('waiting', 'delayed')
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn lease(&self) -> Result<Option<Job>, QueueError> {
        // Single statement, so two workers can never claim the same job
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE state IN ('waiting', 'delayed') AND run_at_ms <= ?
                ORDER BY run_at_ms ASC, created_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(chrono::Utc::now().timestamp())
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let result = sqlx::query("UPDATE jobs SET state = 'completed', updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let job = self
            .fetch(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let now = now_ms();
        let updated_at = chrono::Utc::now().timestamp();

        if self.policy.is_exhausted(job.attempts) {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(error)
            .bind(updated_at)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            return Ok(FailOutcome::Exhausted);
        }

        let run_at_ms = now.saturating_add(delay_ms(self.policy.next_delay(job.attempts)));
        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, run_at_ms = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(pending_state(run_at_ms, now).as_str())
        .bind(run_at_ms)
        .bind(error)
        .bind(updated_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(FailOutcome::Retry { run_at_ms })
    }

    async fn next_due_at(&self) -> Result<Option<i64>, QueueError> {
        let row = sqlx::query(
            "SELECT MIN(run_at_ms) AS next_run FROM jobs WHERE state IN ('waiting', 'delayed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<i64>, _>("next_run"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn queue(policy: RetryPolicy) -> (SqliteQueue, Database) {
        let db = Database::in_memory().await.unwrap();
        (SqliteQueue::new(db.pool().clone(), policy), db)
    }

    fn request(key: &str, run_at_ms: i64) -> EnqueueRequest {
        EnqueueRequest {
            key: key.to_string(),
            post_id: "post-1".to_string(),
            payload: json!({ "postId": "post-1" }),
            run_at_ms,
        }
    }

    #[tokio::test]
    async fn test_available() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        assert!(queue.is_available().await);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_on_key() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        let later = now_ms() + 3_600_000;
        let first = queue.enqueue(request("publish:post-1", later)).await.unwrap();
        let second = queue.enqueue(request("publish:post-1", 0)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.run_at_ms, later);
        assert_eq!(second.state, JobState::Delayed);
        assert_eq!(second.payload, json!({ "postId": "post-1" }));
    }

    #[tokio::test]
    async fn test_lease_complete() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        let job = queue.enqueue(request("publish:post-1", 0)).await.unwrap();

        let leased = queue.lease().await.unwrap().unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.state, JobState::Active);
        assert!(queue.lease().await.unwrap().is_none());

        queue.complete(&job.id).await.unwrap();
        assert_eq!(queue.state(&job.id).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_delayed_job_waits() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        let later = now_ms() + 60_000;
        queue.enqueue(request("publish:post-1", later)).await.unwrap();
        assert!(queue.lease().await.unwrap().is_none());
        assert_eq!(queue.next_due_at().await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_cancel_and_key_release() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        let first = queue
            .enqueue(request("publish:post-1", now_ms() + 60_000))
            .await
            .unwrap();
        assert!(queue.cancel(&first.id).await.unwrap());
        assert!(!queue.cancel(&first.id).await.unwrap());
        assert!(queue.next_due_at().await.unwrap().is_none());

        let second = queue.enqueue(request("publish:post-1", 0)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(queue.get(&first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_job_cannot_be_cancelled() {
        let (queue, _db) = queue(RetryPolicy::default()).await;
        let job = queue.enqueue(request("publish:post-1", 0)).await.unwrap();
        queue.lease().await.unwrap();
        assert!(!queue.cancel(&job.id).await.unwrap());
        assert_eq!(queue.state(&job.id).await.unwrap(), Some(JobState::Active));
    }

    #[tokio::test]
    async fn test_fail_retries_then_exhausts() {
        let (queue, _db) = queue(RetryPolicy::immediate(3)).await;
        let job = queue.enqueue(request("publish:post-1", 0)).await.unwrap();

        let mut outcomes = Vec::new();
        while let Some(leased) = queue.lease().await.unwrap() {
            outcomes.push(queue.fail(&leased.id, "provider down").await.unwrap());
        }

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], FailOutcome::Retry { .. }));
        assert!(matches!(outcomes[1], FailOutcome::Retry { .. }));
        assert_eq!(outcomes[2], FailOutcome::Exhausted);

        let failed = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.last_error.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();

        let job_id = {
            let db = Database::new(path).await.unwrap();
            let queue = SqliteQueue::new(db.pool().clone(), RetryPolicy::default());
            queue.enqueue(request("publish:post-1", 0)).await.unwrap().id
        };

        let db = Database::new(path).await.unwrap();
        let queue = SqliteQueue::new(db.pool().clone(), RetryPolicy::default());
        assert_eq!(queue.lease().await.unwrap().unwrap().id, job_id);
    }
}
