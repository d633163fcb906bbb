//! The task queue: claim, run, complete, fail, dead-letter, reclaim.
//!
//! Acquisition is the correctness primitive of the whole engine: a CTE
//! selects eligible rows with `FOR UPDATE SKIP LOCKED` so concurrent
//! workers never block on or double-claim the same task, then the same
//! statement flips them to LOCKED under this worker's id. Everything else
//! is guarded single-statement updates or short transactions.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{KonduitError, Result};
use crate::model::{DeadLetter, ErrorHistoryEntry, Task, TaskStatus, TASK_COLUMNS};
use crate::retry::{compute_delay, RetryPolicy};

/// What `fail` decided for the task.
#[derive(Debug)]
pub enum FailOutcome {
    /// Attempts remain; the task is PENDING again and eligible at
    /// `task.next_retry_at`.
    Retrying { task: Task },
    /// The retry budget is exhausted; a dead letter was recorded.
    DeadLettered { task: Task, dead_letter: DeadLetter },
}

impl FailOutcome {
    pub fn task(&self) -> &Task {
        match self {
            FailOutcome::Retrying { task } | FailOutcome::DeadLettered { task, .. } => task,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered { .. })
    }
}

pub struct TaskQueue {
    pool: PgPool,
    lock_timeout: Duration,
}

impl TaskQueue {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claim up to `batch_size` eligible tasks for `worker_id`.
    ///
    /// Eligible means PENDING with no retry hold, oldest first. Claiming
    /// increments the attempt counter: the returned rows carry the 1-based
    /// attempt number the handler is about to run.
    pub async fn acquire(&self, worker_id: &str, batch_size: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM tasks
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'locked',
                locked_by = $2,
                locked_at = NOW(),
                lock_timeout_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                attempt = attempt + 1,
                version = version + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(batch_size)
        .bind(worker_id)
        .bind((self.lock_timeout.as_millis() as i64).to_string())
        .fetch_all(&self.pool)
        .await?;

        if !tasks.is_empty() {
            debug!(worker_id, count = tasks.len(), "acquired tasks");
        }
        Ok(tasks)
    }

    /// Transition a claimed task LOCKED -> RUNNING and stamp `started_at`.
    pub async fn start(&self, task_id: Uuid) -> Result<Task> {
        let updated = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = NOW(),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'locked'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(task) => Ok(task),
            None => Err(self.precondition_failure(task_id).await?),
        }
    }

    /// Record a successful attempt.
    ///
    /// Fails with [`KonduitError::TaskPrecondition`] when the task is no
    /// longer in flight, e.g. because it was reclaimed and finished by another
    /// worker. Callers treat that as a lost race.
    pub async fn complete(&self, task_id: Uuid, output: Option<&Value>) -> Result<Task> {
        let updated = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'completed',
                output = $2,
                error = NULL,
                completed_at = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                lock_timeout_at = NULL,
                next_retry_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('locked', 'running')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .bind(output)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(task) => Ok(task),
            None => Err(self.precondition_failure(task_id).await?),
        }
    }

    /// Record a failed attempt: reschedule with backoff if attempts remain,
    /// otherwise dead-letter in the same transaction.
    ///
    /// The task row's snapshotted `backoff_strategy`/`backoff_base_ms` are
    /// authoritative for the delay; `policy` contributes the clamp and
    /// jitter flag.
    pub async fn fail(&self, task_id: Uuid, error: &str, policy: &RetryPolicy) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(KonduitError::TaskNotFound(task_id))?;

        if !matches!(task.status, TaskStatus::Locked | TaskStatus::Running) {
            return Err(KonduitError::TaskPrecondition {
                id: task_id,
                status: task.status,
            });
        }

        let mut history = task.error_entries();
        history.push(ErrorHistoryEntry {
            attempt: task.attempt,
            error: error.to_string(),
            at: Utc::now(),
        });
        let history_json = serde_json::to_value(&history)?;

        let outcome = if task.attempt < task.max_attempts {
            let mut rng = fastrand::Rng::new();
            let delay = compute_delay(
                task.backoff_strategy,
                task.backoff_base_ms,
                policy.max_delay_ms,
                policy.jitter,
                task.attempt,
                &mut rng,
            )?;
            let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

            let task = sqlx::query_as::<_, Task>(&format!(
                r#"
                UPDATE tasks
                SET status = 'pending',
                    next_retry_at = $2,
                    error = $3,
                    error_history = $4,
                    locked_by = NULL,
                    locked_at = NULL,
                    lock_timeout_at = NULL,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING {TASK_COLUMNS}
                "#
            ))
            .bind(task_id)
            .bind(next_retry_at)
            .bind(error)
            .bind(&history_json)
            .fetch_one(&mut *tx)
            .await?;

            debug!(
                task_id = %task_id,
                attempt = task.attempt,
                next_retry_at = %next_retry_at,
                "task failed, retry scheduled"
            );
            FailOutcome::Retrying { task }
        } else {
            let task = sqlx::query_as::<_, Task>(&format!(
                r#"
                UPDATE tasks
                SET status = 'dead_letter',
                    error = $2,
                    error_history = $3,
                    completed_at = NOW(),
                    locked_by = NULL,
                    locked_at = NULL,
                    lock_timeout_at = NULL,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING {TASK_COLUMNS}
                "#
            ))
            .bind(task_id)
            .bind(error)
            .bind(&history_json)
            .fetch_one(&mut *tx)
            .await?;

            let workflow_name = sqlx::query_scalar::<_, String>(
                "SELECT workflow_name FROM executions WHERE id = $1",
            )
            .bind(task.execution_id)
            .fetch_one(&mut *tx)
            .await?;

            let dead_letter = DeadLetter::insert(
                task.id,
                task.execution_id,
                &workflow_name,
                &task.step_name,
                task.input.as_ref(),
                &history_json,
                error,
                task.attempt,
                &mut *tx,
            )
            .await?;

            info!(
                task_id = %task_id,
                step = %task.step_name,
                attempts = task.attempt,
                "task dead-lettered"
            );
            FailOutcome::DeadLettered { task, dead_letter }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Dead-letter an in-flight task immediately, ignoring remaining
    /// attempts. For operator intervention and non-retryable failures.
    pub async fn dead_letter(&self, task_id: Uuid, error: &str) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(KonduitError::TaskNotFound(task_id))?;

        if !matches!(task.status, TaskStatus::Locked | TaskStatus::Running) {
            return Err(KonduitError::TaskPrecondition {
                id: task_id,
                status: task.status,
            });
        }

        let mut history = task.error_entries();
        history.push(ErrorHistoryEntry {
            attempt: task.attempt,
            error: error.to_string(),
            at: Utc::now(),
        });
        let history_json = serde_json::to_value(&history)?;

        let task = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'dead_letter',
                error = $2,
                error_history = $3,
                completed_at = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                lock_timeout_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .bind(error)
        .bind(&history_json)
        .fetch_one(&mut *tx)
        .await?;

        let workflow_name =
            sqlx::query_scalar::<_, String>("SELECT workflow_name FROM executions WHERE id = $1")
                .bind(task.execution_id)
                .fetch_one(&mut *tx)
                .await?;

        let dead_letter = DeadLetter::insert(
            task.id,
            task.execution_id,
            &workflow_name,
            &task.step_name,
            task.input.as_ref(),
            &history_json,
            error,
            task.attempt,
            &mut *tx,
        )
        .await?;

        tx.commit().await?;
        info!(task_id = %task_id, step = %task.step_name, "task force dead-lettered");
        Ok(FailOutcome::DeadLettered { task, dead_letter })
    }

    /// Return expired in-flight tasks to PENDING.
    ///
    /// The status guard keeps this idempotent and race-free: a slow worker
    /// that finished between scan and update moved its task to a terminal
    /// status, which the predicate no longer matches. The attempt counter
    /// is preserved so a crash is charged at most the attempt it already
    /// claimed.
    pub async fn reclaim_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                lock_timeout_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE status IN ('locked', 'running')
              AND lock_timeout_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed orphaned tasks");
        }
        Ok(reclaimed)
    }

    /// Requeue a dead-lettered task with a fresh attempt budget and stamp
    /// its dead letter reprocessed. The owning execution stays terminal;
    /// this re-runs the step for its side effects.
    pub async fn reprocess_dead_letter(&self, task_id: Uuid) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(KonduitError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::DeadLetter {
            return Err(KonduitError::TaskPrecondition {
                id: task_id,
                status: task.status,
            });
        }

        let task = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempt = 0,
                next_retry_at = NULL,
                error = NULL,
                completed_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        DeadLetter::mark_reprocessed(task_id, &mut *tx).await?;
        tx.commit().await?;

        info!(task_id = %task_id, step = %task.step_name, "dead letter requeued");
        Ok(task)
    }

    /// Fan-in helper: sibling tasks of a parallel group.
    pub async fn group_tasks(&self, execution_id: Uuid, parallel_group: Uuid) -> Result<Vec<Task>> {
        Task::find_group(execution_id, parallel_group, &self.pool).await
    }

    /// Fan-in helper: number of siblings not yet in a terminal status.
    pub async fn count_unfinished_in_group(
        &self,
        execution_id: Uuid,
        parallel_group: Uuid,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM tasks
            WHERE execution_id = $1
              AND parallel_group = $2
              AND status NOT IN ('completed', 'failed', 'dead_letter')
            "#,
        )
        .bind(execution_id)
        .bind(parallel_group)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Build the precondition error for a guard miss, distinguishing a
    /// vanished row from one in the wrong status.
    async fn precondition_failure(&self, task_id: Uuid) -> Result<KonduitError> {
        let task = Task::find_by_id(task_id, &self.pool).await?;
        Ok(KonduitError::TaskPrecondition {
            id: task_id,
            status: task.status,
        })
    }
}
