//! Dead letter model: the post-mortem record of an exhausted task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::error::{KonduitError, Result};

const DEAD_LETTER_COLUMNS: &str = "id, task_id, execution_id, workflow_name, step_name, input, \
     error_history, last_error, total_attempts, reprocessed, reprocessed_at, created_at";

/// One per task that exhausted its retry budget. `task_id` is unique so a
/// task can never dead-letter twice.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    pub input: Option<Value>,
    /// Ordered per-attempt history, one entry per failed attempt.
    pub error_history: Value,
    pub last_error: String,
    pub total_attempts: i32,
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        task_id: Uuid,
        execution_id: Uuid,
        workflow_name: &str,
        step_name: &str,
        input: Option<&Value>,
        error_history: &Value,
        last_error: &str,
        total_attempts: i32,
        db: impl PgExecutor<'_>,
    ) -> Result<Self> {
        let dead_letter = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO dead_letters (
                id, task_id, execution_id, workflow_name, step_name, input,
                error_history, last_error, total_attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(execution_id)
        .bind(workflow_name)
        .bind(step_name)
        .bind(input)
        .bind(error_history)
        .bind(last_error)
        .bind(total_attempts)
        .fetch_one(db)
        .await?;

        Ok(dead_letter)
    }

    pub async fn find_by_task_id(task_id: Uuid, db: impl PgExecutor<'_>) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(db)
        .await?
        .ok_or(KonduitError::DeadLetterNotFound(task_id))
    }

    pub async fn list(limit: i64, db: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        let dead_letters = sqlx::query_as::<_, Self>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(dead_letters)
    }

    /// Stamp the record as reprocessed; returns false when it already was.
    pub async fn mark_reprocessed(task_id: Uuid, db: impl PgExecutor<'_>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET reprocessed = TRUE, reprocessed_at = NOW()
            WHERE task_id = $1 AND reprocessed = FALSE
            "#,
        )
        .bind(task_id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
