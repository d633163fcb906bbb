//! Error taxonomy for the execution kernel.

use uuid::Uuid;

use crate::model::{ExecutionStatus, TaskStatus};

/// Errors surfaced by the engine's public operations.
///
/// Handler failures never appear here: they are captured as strings on the
/// task row and drive the retry/dead-letter pipeline instead.
#[derive(Debug, thiserror::Error)]
pub enum KonduitError {
    /// An execution status change that the state machine forbids.
    #[error("invalid execution state transition: {from:?} -> {to:?}")]
    StateTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Trigger was called for a workflow name that was never registered.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A branch element had no arm matching the selector and no fallback.
    #[error("no branch arm matched selector {selector:?} in workflow '{workflow}'")]
    NoBranchMatched { workflow: String, selector: String },

    /// A workflow definition failed validation at registration.
    #[error("invalid workflow definition '{workflow}': {reason}")]
    InvalidDefinition { workflow: String, reason: String },

    /// Retry policy construction or delay computation rejected its inputs.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// A queue operation found the task in a status it cannot act on,
    /// typically because another path already finished it.
    #[error("task {id} precondition failed: expected an in-flight task, found {status:?}")]
    TaskPrecondition { id: Uuid, status: TaskStatus },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("no dead letter recorded for task {0}")]
    DeadLetterNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl KonduitError {
    /// Whether this error is a lost race against another worker or code
    /// path, which callers log and treat as a no-op.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            KonduitError::TaskPrecondition { .. } | KonduitError::StateTransition { .. }
        )
    }
}

pub type Result<T, E = KonduitError> = std::result::Result<T, E>;
