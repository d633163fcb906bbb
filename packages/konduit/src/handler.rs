//! The step handler contract.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

/// Everything a handler may observe about the attempt it is running.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    /// 1-based attempt number, counting the first execution.
    pub attempt: i32,
    /// The value the advancer passed to this step. After a parallel block
    /// this is the original execution input; use [`StepContext::parallel_outputs`]
    /// for the siblings' results.
    pub input: Option<Value>,
    /// Output of the previous element, when there is one.
    pub previous_output: Option<Value>,
    /// The input the execution was triggered with. Always available.
    pub execution_input: Option<Value>,
    /// Sibling outputs keyed by step name when the previous element was a
    /// parallel block; empty otherwise.
    pub parallel_outputs: HashMap<String, Value>,
}

impl StepContext {
    /// Output of a specific parallel sibling, if the previous element was a
    /// parallel block and that sibling produced one.
    pub fn parallel_output(&self, step_name: &str) -> Option<&Value> {
        self.parallel_outputs.get(step_name)
    }
}

/// A unit of work bound to a workflow step.
///
/// Handlers must be idempotent: the engine guarantees at-least-once
/// execution, not exactly-once. Any error return is captured as that
/// attempt's error string and drives the retry/dead-letter pipeline.
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> Result<Option<Value>>;
}

/// Wrap a synchronous closure as a [`StepHandler`].
///
/// Convenient for small steps and tests; implement the trait directly when
/// the handler needs to await.
pub fn handler_fn<F>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Result<Option<Value>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Result<Option<Value>> + Send + Sync + 'static,
{
    async fn execute(&self, ctx: StepContext) -> Result<Option<Value>> {
        (self.0)(ctx)
    }
}
