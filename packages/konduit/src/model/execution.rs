//! Execution model and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgExecutor};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{KonduitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }

    /// The transition table. Terminal states are absorbing.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }

    fn sql_name(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }

    /// Statuses from which `to` is reachable, as SQL enum labels.
    fn sources_of(to: ExecutionStatus) -> Vec<String> {
        [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::TimedOut,
        ]
        .iter()
        .filter(|from| from.can_transition_to(to))
        .map(|from| from.sql_name().to_string())
        .collect()
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_name, workflow_version, status, input, output, \
     current_step, idempotency_key, deadline_at, error, started_at, completed_at, \
     created_at, updated_at";

/// One instance of running a workflow.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Execution {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: i32,
    #[builder(default)]
    pub status: ExecutionStatus,
    #[builder(default, setter(strip_option))]
    pub input: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub output: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub current_step: Option<String>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub deadline_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<Self> {
        let execution = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO executions (
                id, workflow_name, workflow_version, status, input, output,
                current_step, idempotency_key, deadline_at, error, started_at, completed_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.workflow_name)
        .bind(self.workflow_version)
        .bind(self.status)
        .bind(&self.input)
        .bind(&self.output)
        .bind(&self.current_step)
        .bind(&self.idempotency_key)
        .bind(self.deadline_at)
        .bind(&self.error)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(execution)
    }

    pub async fn find_by_id(id: Uuid, db: impl PgExecutor<'_>) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(KonduitError::ExecutionNotFound(id))
    }

    pub async fn find_by_idempotency_key(key: &str, db: impl PgExecutor<'_>) -> Result<Option<Self>> {
        let execution = sqlx::query_as::<_, Self>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(db)
        .await?;

        Ok(execution)
    }

    /// Take the per-execution row lock that serializes advancement.
    pub async fn lock_for_update(id: Uuid, db: impl PgExecutor<'_>) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(KonduitError::ExecutionNotFound(id))
    }

    /// Drive the execution state machine.
    ///
    /// The status guard in the UPDATE makes the transition atomic: a row is
    /// only changed when its current status may legally reach `to`, and the
    /// timestamps are stamped in the same statement (`started_at` on
    /// RUNNING, `completed_at` on any terminal status). A guard miss is
    /// reported as [`KonduitError::StateTransition`] with the status found.
    pub async fn transition(
        conn: &mut sqlx::PgConnection,
        id: Uuid,
        to: ExecutionStatus,
        error: Option<&str>,
        output: Option<&Value>,
    ) -> Result<Self> {
        let updated = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE executions
            SET status = $2,
                error = COALESCE($3, error),
                output = COALESCE($4, output),
                started_at = CASE WHEN $5 THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $6 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status::TEXT = ANY($7)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to)
        .bind(error)
        .bind(output)
        .bind(to == ExecutionStatus::Running)
        .bind(to.is_terminal())
        .bind(ExecutionStatus::sources_of(to))
        .fetch_optional(&mut *conn)
        .await?;

        match updated {
            Some(execution) => Ok(execution),
            None => {
                let current = Self::find_by_id(id, &mut *conn).await?;
                Err(KonduitError::StateTransition {
                    from: current.status,
                    to,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::TimedOut,
    ];

    #[test]
    fn pending_may_start_or_cancel_only() {
        let from = ExecutionStatus::Pending;
        assert!(from.can_transition_to(ExecutionStatus::Running));
        assert!(from.can_transition_to(ExecutionStatus::Cancelled));
        assert!(!from.can_transition_to(ExecutionStatus::Completed));
        assert!(!from.can_transition_to(ExecutionStatus::Failed));
        assert!(!from.can_transition_to(ExecutionStatus::TimedOut));
    }

    #[test]
    fn running_may_reach_any_terminal_state() {
        let from = ExecutionStatus::Running;
        assert!(from.can_transition_to(ExecutionStatus::Completed));
        assert!(from.can_transition_to(ExecutionStatus::Failed));
        assert!(from.can_transition_to(ExecutionStatus::Cancelled));
        assert!(from.can_transition_to(ExecutionStatus::TimedOut));
        assert!(!from.can_transition_to(ExecutionStatus::Pending));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from:?} must not transition to {to:?}"
                );
            }
        }
    }

    #[test]
    fn sources_of_inverts_the_transition_table() {
        assert_eq!(
            ExecutionStatus::sources_of(ExecutionStatus::Running),
            vec!["pending".to_string()]
        );
        let mut cancel_sources = ExecutionStatus::sources_of(ExecutionStatus::Cancelled);
        cancel_sources.sort();
        assert_eq!(cancel_sources, vec!["pending".to_string(), "running".to_string()]);
    }

    #[test]
    fn builder_defaults_to_a_fresh_pending_execution() {
        let execution = Execution::builder()
            .workflow_name("orders")
            .workflow_version(1)
            .build();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.started_at.is_none());
        assert!(execution.completed_at.is_none());
    }
}
