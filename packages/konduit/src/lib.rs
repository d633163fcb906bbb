//! Konduit: a durable workflow orchestration engine backed by PostgreSQL.
//!
//! Workflows are linear sequences of sequential steps, parallel fan-out
//! blocks, and conditional branches. Every execution and every task
//! attempt is persisted, so workflows survive process crashes, resume
//! after restart, and run with at-least-once semantics; handlers must be
//! idempotent.
//!
//! # Architecture
//!
//! ```text
//! trigger(workflow, input)
//!     │
//!     ├─► executions row (RUNNING) + first element's task rows (dispatcher)
//!     └─► notifier wakes workers
//!
//! WorkerPool
//!     ├─► acquire: FOR UPDATE SKIP LOCKED claim, attempt += 1
//!     ├─► run handler (per-attempt timeout watchdog)
//!     ├─► complete / fail (retry backoff or dead letter)
//!     └─► ExecutionAdvancer: serialized per execution by a row lock;
//!         fan-in counting, branch walking, next element dispatch,
//!         terminal transition
//!
//! Maintenance
//!     ├─► reclaim orphaned locks (lock_timeout elapsed)
//!     ├─► time out executions past their deadline
//!     └─► stale-worker marking + retention purge (leader-gated)
//! ```
//!
//! The coordination layer (Redis pub/sub wakeups and a TTL leader lock) is
//! best-effort: without it the engine degrades to polling and
//! everyone-is-leader, both of which stay correct.

pub mod advancer;
pub mod config;
pub mod coordination;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod maintenance;
pub mod model;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;
pub mod workflow;

pub use config::KonduitConfig;
pub use engine::Konduit;
pub use error::{KonduitError, Result};
pub use handler::{handler_fn, StepContext, StepHandler};
pub use model::{
    DeadLetter, ErrorHistoryEntry, Execution, ExecutionStatus, StepType, Task, TaskStatus,
    WorkerRecord, WorkerStatus,
};
pub use queue::{FailOutcome, TaskQueue};
pub use retry::{compute_delay, BackoffStrategy, RetryPolicy};
pub use workflow::{BranchArm, StepDefinition, WorkflowDefinition, WorkflowElement, WorkflowRegistry};
