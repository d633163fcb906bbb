//! Task model: one attempt-bearing unit of work inside an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgExecutor};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{KonduitError, Result};
use crate::retry::BackoffStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Locked,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Sequential,
    Parallel,
    Branch,
}

/// One entry of a task's per-attempt error trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorHistoryEntry {
    pub attempt: i32,
    pub error: String,
    pub at: DateTime<Utc>,
}

pub(crate) const TASK_COLUMNS: &str = "id, execution_id, step_name, step_type, step_order, \
     status, input, output, error, error_history, attempt, max_attempts, next_retry_at, \
     locked_by, locked_at, lock_timeout_at, timeout_ms, parallel_group, branch_key, \
     backoff_strategy, backoff_base_ms, version, started_at, completed_at, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_type: StepType,
    pub step_order: i32,
    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default, setter(strip_option))]
    pub input: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub output: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default = Value::Array(Vec::new()))]
    pub error_history: Value,
    /// 1-based while in flight; 0 until the first claim.
    #[builder(default = 0)]
    pub attempt: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lock_timeout_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub parallel_group: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub branch_key: Option<String>,
    #[builder(default)]
    pub backoff_strategy: BackoffStrategy,
    #[builder(default = 1_000)]
    pub backoff_base_ms: i64,
    #[builder(default = 1)]
    pub version: i32,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Deserialize the per-attempt error trail.
    pub fn error_entries(&self) -> Vec<ErrorHistoryEntry> {
        serde_json::from_value(self.error_history.clone()).unwrap_or_default()
    }

    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<Self> {
        let task = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO tasks (
                id, execution_id, step_name, step_type, step_order,
                status, input, output, error, error_history, attempt, max_attempts, next_retry_at,
                locked_by, locked_at, lock_timeout_at, timeout_ms, parallel_group, branch_key,
                backoff_strategy, backoff_base_ms, version, started_at, completed_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19,
                $20, $21, $22, $23, $24, $25, $26
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.execution_id)
        .bind(&self.step_name)
        .bind(self.step_type)
        .bind(self.step_order)
        .bind(self.status)
        .bind(&self.input)
        .bind(&self.output)
        .bind(&self.error)
        .bind(&self.error_history)
        .bind(self.attempt)
        .bind(self.max_attempts)
        .bind(self.next_retry_at)
        .bind(&self.locked_by)
        .bind(self.locked_at)
        .bind(self.lock_timeout_at)
        .bind(self.timeout_ms)
        .bind(self.parallel_group)
        .bind(&self.branch_key)
        .bind(self.backoff_strategy)
        .bind(self.backoff_base_ms)
        .bind(self.version)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(task)
    }

    pub async fn find_by_id(id: Uuid, db: impl PgExecutor<'_>) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(db)
            .await?
            .ok_or(KonduitError::TaskNotFound(id))
    }

    /// All tasks of an execution in dispatch order.
    pub async fn find_by_execution(execution_id: Uuid, db: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE execution_id = $1 ORDER BY step_order, created_at"
        ))
        .bind(execution_id)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// All sibling tasks of a parallel group, for fan-in evaluation.
    pub async fn find_group(
        execution_id: Uuid,
        parallel_group: Uuid,
        db: impl PgExecutor<'_>,
    ) -> Result<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE execution_id = $1 AND parallel_group = $2
            ORDER BY created_at
            "#
        ))
        .bind(execution_id)
        .bind(parallel_group)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// Whether any task beyond the given element order already exists.
    ///
    /// The advancer's dispatch-once guard: when two siblings finish close
    /// together, the second advancement sees the first one's dispatch and
    /// stops.
    pub async fn exists_beyond_order(
        execution_id: Uuid,
        step_order: i32,
        db: impl PgExecutor<'_>,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE execution_id = $1 AND step_order > $2)",
        )
        .bind(execution_id)
        .bind(step_order)
        .fetch_one(db)
        .await?;

        Ok(exists)
    }

    /// Whether a task for the given step already exists in this execution.
    pub async fn exists_for_step(
        execution_id: Uuid,
        step_name: &str,
        db: impl PgExecutor<'_>,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE execution_id = $1 AND step_name = $2)",
        )
        .bind(execution_id)
        .bind(step_name)
        .fetch_one(db)
        .await?;

        Ok(exists)
    }
}
