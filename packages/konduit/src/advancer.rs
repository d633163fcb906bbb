//! The execution advancer: decides what runs next when a task reaches a
//! terminal status.
//!
//! Advancement is serialized per execution by a `SELECT ... FOR UPDATE` on
//! the execution row. Concurrent completions for the same execution queue
//! behind that lock, which is what makes parallel fan-in race-free; a
//! dispatch-once guard (has anything past this element been materialized
//! yet?) keeps the loser of the race from dispatching the next element a
//! second time.

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::coordination::TaskNotifier;
use crate::dispatcher::TaskDispatcher;
use crate::error::{KonduitError, Result};
use crate::model::{Execution, ExecutionStatus, Task, TaskStatus};
use crate::workflow::{LocatedStep, WorkflowDefinition, WorkflowRegistry};

pub struct ExecutionAdvancer {
    pool: PgPool,
    registry: Arc<WorkflowRegistry>,
    dispatcher: TaskDispatcher,
    notifier: Arc<dyn TaskNotifier>,
}

/// What the terminal task means for its element.
enum ElementOutcome {
    /// The element is finished; carry this output forward.
    Complete { output: Option<Value> },
    /// Parallel siblings are still running; nothing to do yet.
    Waiting,
    /// The element failed the execution.
    Failed { error: String },
    /// A branch arm has more steps; the next one was materialized.
    ArmContinued,
}

impl ExecutionAdvancer {
    pub fn new(
        pool: PgPool,
        registry: Arc<WorkflowRegistry>,
        dispatcher: TaskDispatcher,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        Self {
            pool,
            registry,
            dispatcher,
            notifier,
        }
    }

    /// Advance the owning execution after `task` reached a terminal status.
    ///
    /// Invoked on COMPLETED tasks and on DEAD_LETTER tasks (the latter so
    /// parallel fan-in can account for dead siblings and sequential
    /// failures can fail the execution).
    pub async fn on_task_terminal(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let execution = Execution::lock_for_update(task.execution_id, &mut *tx).await?;
        if execution.status.is_terminal() {
            debug!(
                execution_id = %execution.id,
                status = ?execution.status,
                "execution already terminal, skipping advancement"
            );
            return Ok(());
        }

        let definition = self
            .registry
            .get(&execution.workflow_name)
            .ok_or_else(|| KonduitError::WorkflowNotFound(execution.workflow_name.clone()))?;

        let located = definition
            .locate(&task.step_name, task.branch_key.as_deref())
            .ok_or_else(|| KonduitError::InvalidDefinition {
                workflow: definition.name.clone(),
                reason: format!("task step '{}' not present in registered definition", task.step_name),
            })?;
        let element_index = located.element_index();

        let outcome = match located {
            LocatedStep::Sequential { .. } => self.sequential_outcome(task),
            LocatedStep::Parallel { .. } => self.parallel_outcome(&mut tx, &execution, task).await?,
            LocatedStep::Branch { arm, position, .. } => {
                self.branch_outcome(&mut tx, &execution, task, arm, position)
                    .await?
            }
        };

        match outcome {
            ElementOutcome::Waiting => {
                tx.commit().await?;
                Ok(())
            }
            ElementOutcome::ArmContinued => {
                tx.commit().await?;
                self.notifier.notify_tasks_available().await;
                Ok(())
            }
            ElementOutcome::Failed { error } => {
                Execution::transition(
                    &mut tx,
                    execution.id,
                    ExecutionStatus::Failed,
                    Some(&error),
                    None,
                )
                .await?;
                tx.commit().await?;
                info!(execution_id = %execution.id, error = %error, "execution failed");
                Ok(())
            }
            ElementOutcome::Complete { output } => {
                self.advance_element(tx, &execution, &definition, element_index, output)
                    .await
            }
        }
    }

    fn sequential_outcome(&self, task: &Task) -> ElementOutcome {
        if task.status == TaskStatus::Completed {
            ElementOutcome::Complete {
                output: task.output.clone(),
            }
        } else {
            ElementOutcome::Failed {
                error: step_failure_message(task),
            }
        }
    }

    /// Fan-in evaluation: wait for the last sibling, then either fail the
    /// execution (any dead sibling) or aggregate outputs by step name.
    async fn parallel_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        execution: &Execution,
        task: &Task,
    ) -> Result<ElementOutcome> {
        let group = task.parallel_group.ok_or_else(|| KonduitError::InvalidDefinition {
            workflow: execution.workflow_name.clone(),
            reason: format!("parallel task '{}' has no group id", task.step_name),
        })?;

        let siblings = Task::find_group(execution.id, group, &mut **tx).await?;
        if siblings.iter().any(|s| !s.status.is_terminal()) {
            return Ok(ElementOutcome::Waiting);
        }

        let dead: Vec<&Task> = siblings
            .iter()
            .filter(|s| matches!(s.status, TaskStatus::DeadLetter | TaskStatus::Failed))
            .collect();
        if !dead.is_empty() {
            let names: Vec<&str> = dead.iter().map(|t| t.step_name.as_str()).collect();
            return Ok(ElementOutcome::Failed {
                error: format!("parallel steps dead-lettered: {}", names.join(", ")),
            });
        }

        let mut outputs = Map::new();
        for sibling in &siblings {
            outputs.insert(
                sibling.step_name.clone(),
                sibling.output.clone().unwrap_or(Value::Null),
            );
        }
        Ok(ElementOutcome::Complete {
            output: Some(Value::Object(outputs)),
        })
    }

    /// The chosen arm is its own local sequence: either materialize its
    /// next step, or treat the whole branch element as complete.
    async fn branch_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        execution: &Execution,
        task: &Task,
        arm: &[crate::workflow::StepDefinition],
        position: usize,
    ) -> Result<ElementOutcome> {
        if task.status != TaskStatus::Completed {
            return Ok(ElementOutcome::Failed {
                error: step_failure_message(task),
            });
        }

        if position + 1 < arm.len() {
            let next = &arm[position + 1];
            if Task::exists_for_step(execution.id, &next.name, &mut **tx).await? {
                return Ok(ElementOutcome::Waiting);
            }
            let branch_key = task.branch_key.as_deref().unwrap_or_default();
            self.dispatcher
                .dispatch_branch_step(
                    &mut *tx,
                    execution,
                    next,
                    task.step_order as usize,
                    branch_key,
                    task.output.as_ref(),
                )
                .await?;
            return Ok(ElementOutcome::ArmContinued);
        }

        Ok(ElementOutcome::Complete {
            output: task.output.clone(),
        })
    }

    /// The element finished: dispatch what follows it, or complete the
    /// execution when it was the last one.
    async fn advance_element(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        execution: &Execution,
        definition: &WorkflowDefinition,
        element_index: usize,
        output: Option<Value>,
    ) -> Result<()> {
        // Dispatch-once guard: a sibling's advancement may have beaten us
        // past this element while we waited on the row lock.
        if Task::exists_beyond_order(execution.id, element_index as i32, &mut *tx).await? {
            tx.commit().await?;
            return Ok(());
        }

        if element_index + 1 < definition.elements.len() {
            let dispatched = self
                .dispatcher
                .dispatch_element(&mut tx, execution, definition, element_index + 1, output.as_ref())
                .await;

            match dispatched {
                Ok(_) => {
                    tx.commit().await?;
                    self.notifier.notify_tasks_available().await;
                    Ok(())
                }
                Err(KonduitError::NoBranchMatched { selector, .. }) => {
                    let error = format!("no branch arm matched selector {selector:?}");
                    Execution::transition(
                        &mut tx,
                        execution.id,
                        ExecutionStatus::Failed,
                        Some(&error),
                        None,
                    )
                    .await?;
                    tx.commit().await?;
                    info!(execution_id = %execution.id, error = %error, "execution failed");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            Execution::transition(
                &mut tx,
                execution.id,
                ExecutionStatus::Completed,
                None,
                output.as_ref(),
            )
            .await?;
            tx.commit().await?;
            info!(execution_id = %execution.id, "execution completed");
            Ok(())
        }
    }
}

fn step_failure_message(task: &Task) -> String {
    format!(
        "step '{}' dead-lettered after {} attempts: {}",
        task.step_name,
        task.attempt,
        task.error.as_deref().unwrap_or("unknown error")
    )
}
