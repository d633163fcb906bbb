//! Row models for the durable store.
//!
//! Relationships are ids, not object references: executions own tasks,
//! tasks own at most one dead letter, and everything resolves lazily
//! through the store.

mod dead_letter;
mod execution;
mod task;
mod worker;

pub use dead_letter::DeadLetter;
pub use execution::{Execution, ExecutionStatus};
pub(crate) use task::TASK_COLUMNS;
pub use task::{ErrorHistoryEntry, StepType, Task, TaskStatus};
pub use worker::{WorkerRecord, WorkerStatus};
