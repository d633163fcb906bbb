//! Materializes workflow elements into task rows.
//!
//! Runs inside the caller's transaction: the advancer (and the trigger
//! path) own the per-execution serialization, the dispatcher only writes
//! rows. It never deduplicates; callers guarantee at most one dispatch
//! per element transition.

use serde_json::Value;
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{KonduitError, Result};
use crate::model::{Execution, StepType, Task};
use crate::retry::RetryPolicy;
use crate::workflow::{StepDefinition, WorkflowDefinition, WorkflowElement};

/// Reduce a step output to the string a branch selects on.
///
/// `None`/JSON null yield no selector (the branch fails); strings compare
/// by their contents, numbers and booleans by display form, and structured
/// values by their compact JSON serialization.
pub(crate) fn reduce_selector(output: Option<&Value>) -> Option<String> {
    match output {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => serde_json::to_string(other).ok(),
    }
}

pub struct TaskDispatcher {
    default_retry: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(default_retry: RetryPolicy) -> Self {
        Self { default_retry }
    }

    /// The policy in effect for a step.
    pub fn policy_for(&self, step: &StepDefinition) -> RetryPolicy {
        step.retry_policy.unwrap_or(self.default_retry)
    }

    /// Materialize the element at `element_index` into PENDING task rows,
    /// passing `input` as the upstream value.
    pub async fn dispatch_element(
        &self,
        conn: &mut PgConnection,
        execution: &Execution,
        definition: &WorkflowDefinition,
        element_index: usize,
        input: Option<&Value>,
    ) -> Result<Vec<Task>> {
        let element = definition.elements.get(element_index).ok_or_else(|| {
            KonduitError::InvalidDefinition {
                workflow: definition.name.clone(),
                reason: format!("no element at index {element_index}"),
            }
        })?;

        let created = match element {
            WorkflowElement::Sequential(step) => {
                let task = self
                    .create_task(
                        conn,
                        execution,
                        step,
                        StepType::Sequential,
                        element_index,
                        input,
                        None,
                        None,
                    )
                    .await?;
                vec![task]
            }
            WorkflowElement::Parallel { steps } => {
                // Fresh group id; all siblings become eligible together.
                let group = Uuid::new_v4();
                let mut tasks = Vec::with_capacity(steps.len());
                for step in steps {
                    let task = self
                        .create_task(
                            conn,
                            execution,
                            step,
                            StepType::Parallel,
                            element_index,
                            input,
                            Some(group),
                            None,
                        )
                        .await?;
                    tasks.push(task);
                }
                tasks
            }
            WorkflowElement::Branch { arms, fallback } => {
                let selector = reduce_selector(input).ok_or_else(|| {
                    KonduitError::NoBranchMatched {
                        workflow: definition.name.clone(),
                        selector: "null".to_string(),
                    }
                })?;
                let arm = WorkflowDefinition::branch_arm(arms, fallback.as_ref(), &selector)
                    .ok_or_else(|| KonduitError::NoBranchMatched {
                        workflow: definition.name.clone(),
                        selector: selector.clone(),
                    })?;

                // Only the chosen arm's first step materializes; the
                // advancer walks the rest of the arm one step at a time.
                let task = self
                    .create_task(
                        conn,
                        execution,
                        &arm[0],
                        StepType::Branch,
                        element_index,
                        input,
                        None,
                        Some(&selector),
                    )
                    .await?;
                vec![task]
            }
        };

        debug!(
            execution_id = %execution.id,
            element = element_index,
            count = created.len(),
            "dispatched element"
        );
        Ok(created)
    }

    /// Materialize the next step of an already-selected branch arm.
    pub async fn dispatch_branch_step(
        &self,
        conn: &mut PgConnection,
        execution: &Execution,
        step: &StepDefinition,
        element_index: usize,
        branch_key: &str,
        input: Option<&Value>,
    ) -> Result<Task> {
        self.create_task(
            conn,
            execution,
            step,
            StepType::Branch,
            element_index,
            input,
            None,
            Some(branch_key),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_task(
        &self,
        conn: &mut PgConnection,
        execution: &Execution,
        step: &StepDefinition,
        step_type: StepType,
        element_index: usize,
        input: Option<&Value>,
        parallel_group: Option<Uuid>,
        branch_key: Option<&str>,
    ) -> Result<Task> {
        let policy = self.policy_for(step);

        let base = Task::builder()
            .execution_id(execution.id)
            .step_name(step.name.clone())
            .step_type(step_type)
            .step_order(element_index as i32)
            .max_attempts(policy.max_attempts)
            .backoff_strategy(policy.strategy)
            .backoff_base_ms(policy.base_delay_ms)
            .build();
        let task = Task {
            input: input.cloned(),
            timeout_ms: step.timeout.map(|t| t.as_millis() as i64),
            parallel_group,
            branch_key: branch_key.map(str::to_string),
            ..base
        };

        let task = task.insert(&mut *conn).await?;

        // Advisory cursor only; never read for control flow.
        sqlx::query("UPDATE executions SET current_step = $2, updated_at = NOW() WHERE id = $1")
            .bind(execution.id)
            .bind(&task.step_name)
            .execute(&mut *conn)
            .await?;

        Ok(task)
    }
}
