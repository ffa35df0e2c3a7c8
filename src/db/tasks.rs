//! Durable download task queue.
//!
//! Status moves `queued -> running -> succeeded | failed`, or back to
//! `queued` on retry and redelivery. `attempts` counts claims.

use crate::error::DatabaseError;
use crate::{Error, Result};
use std::time::Duration;

use super::{Database, NewTask, StaleTasks, TaskRecord, TaskStatus};

const TASK_COLUMNS: &str = "id, kind, payload, status, attempts, max_attempts, next_attempt_at, \
     last_error, last_error_type, soft_limit_secs, hard_limit_secs, created_at, updated_at, started_at";

fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

impl Database {
    /// Add a task, claimable immediately
    pub async fn enqueue_task(&self, task: &NewTask) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                kind, payload, status, attempts, max_attempts, next_attempt_at,
                soft_limit_secs, hard_limit_secs, created_at, updated_at
            ) VALUES (?, ?, 'queued', 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.kind)
        .bind(&task.payload)
        .bind(i64::from(task.max_attempts))
        .bind(now)
        .bind(i64::try_from(task.soft_limit_secs).unwrap_or(i64::MAX))
        .bind(i64::try_from(task.hard_limit_secs).unwrap_or(i64::MAX))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to enqueue task", e))?;

        let id = result.last_insert_rowid();
        tracing::debug!(task_id = id, kind = %task.kind, "Task enqueued");
        Ok(id)
    }

    /// Claim the oldest due task
    ///
    /// One statement, so two workers can never claim the same task.
    pub async fn claim_next_task(&self) -> Result<Option<TaskRecord>> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'running', attempts = attempts + 1, started_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'queued' AND next_attempt_at <= ?
                ORDER BY next_attempt_at, id
                LIMIT 1
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to claim task", e))
    }

    /// Mark a running task as finished
    pub async fn complete_task(&self, id: i64) -> Result<()> {
        self.finish_task(id, TaskStatus::Succeeded, None, None).await
    }

    /// Mark a task as given up
    pub async fn fail_task(&self, id: i64, error: &str, error_type: &str) -> Result<()> {
        self.finish_task(id, TaskStatus::Failed, Some(error), Some(error_type))
            .await
    }

    async fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<&str>,
        error_type: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, updated_at = ?,
                last_error = COALESCE(?, last_error),
                last_error_type = COALESCE(?, last_error_type)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(error)
        .bind(error_type)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to update task status", e))?;
        Ok(())
    }

    /// Put a task back in the queue after `delay`
    pub async fn retry_task(&self, id: i64, delay: Duration, error: &str, error_type: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'queued', next_attempt_at = ?, last_error = ?, last_error_type = ?,
                started_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now.saturating_add(secs(delay)))
        .bind(error)
        .bind(error_type)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to reschedule task", e))?;
        Ok(())
    }

    /// Return a claimed task to the queue without waiting
    ///
    /// Used for redelivery after a forced stop and when the storage breaker
    /// trips before the task started.
    pub async fn release_task(&self, id: i64, reason: &str) -> Result<()> {
        self.retry_task(id, Duration::ZERO, reason, "redelivered").await
    }

    /// Return a claimed task to the queue and give back its attempt
    pub async fn unclaim_task(&self, id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'queued', attempts = MAX(attempts - 1, 0), started_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to unclaim task", e))?;
        Ok(())
    }

    /// Recover running tasks whose hard limit has passed
    ///
    /// Those belong to a worker that died; live workers never exceed the
    /// hard limit. Tasks with retries left are requeued, the rest are
    /// failed and returned so the caller can record their assets.
    pub async fn requeue_stale_tasks(&self) -> Result<StaleTasks> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'failed', started_at = NULL, updated_at = ?,
                last_error = 'worker lost', last_error_type = 'transient'
            WHERE status = 'running' AND started_at + hard_limit_secs < ? AND attempts > max_attempts
            RETURNING {TASK_COLUMNS}
            "#
        );
        let failed = sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(now)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to fail exhausted stale tasks", e))?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'queued', next_attempt_at = ?, started_at = NULL, updated_at = ?,
                last_error = 'worker lost', last_error_type = 'redelivered'
            WHERE status = 'running' AND started_at + hard_limit_secs < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to requeue stale tasks", e))?;

        let requeued = result.rows_affected();
        if requeued > 0 || !failed.is_empty() {
            tracing::warn!(
                requeued,
                failed = failed.len(),
                "Recovered tasks abandoned by a previous worker"
            );
        }
        Ok(StaleTasks { requeued, failed })
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to get task", e))
    }

    /// Number of tasks in a status
    pub async fn count_tasks(&self, status: TaskStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to count tasks", e))
    }

    /// Seconds until the next queued task is due, if any is queued
    pub async fn next_due_in(&self) -> Result<Option<Duration>> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT MIN(next_attempt_at) FROM tasks WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_failed("Failed to query next task", e))?;
        let now = chrono::Utc::now().timestamp();
        Ok(next.map(|at| Duration::from_secs(u64::try_from(at - now).unwrap_or(0))))
    }
}
