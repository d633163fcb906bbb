//! The worker pool: claims tasks, runs handlers, reports outcomes.
//!
//! A single pool hosts up to `concurrency` in-flight task executions on
//! the runtime. Between claims it sleeps on whichever fires first: the
//! poll timer, a push notification, or a freed slot. Heartbeats are
//! informational; task safety rests entirely on lock timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advancer::ExecutionAdvancer;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::handler::{StepContext, StepHandler};
use crate::model::{Execution, Task, WorkerRecord, WorkerStatus};
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::workflow::{WorkflowElement, WorkflowRegistry};

/// Canonical error recorded when a step exceeds its per-attempt deadline.
const TIMEOUT_ERROR: &str = "task timed out";

pub struct WorkerPool {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkflowRegistry>,
    advancer: Arc<ExecutionAdvancer>,
    /// Woken by the coordination layer when new tasks exist.
    wakeup: Arc<Notify>,
    config: WorkerConfig,
    batch_size: i64,
    default_retry: RetryPolicy,
    active: AtomicUsize,
    slot_freed: Notify,
}

/// Everything resolved up front for one attempt.
struct Invocation {
    ctx: StepContext,
    handler: Arc<dyn StepHandler>,
    policy: RetryPolicy,
}

/// Decrements the in-flight counter when the attempt ends, no matter how.
struct SlotGuard {
    worker: Arc<WorkerPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.worker.active.fetch_sub(1, Ordering::SeqCst);
        self.worker.slot_freed.notify_one();
    }
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkflowRegistry>,
        advancer: Arc<ExecutionAdvancer>,
        wakeup: Arc<Notify>,
        config: WorkerConfig,
        batch_size: i64,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            advancer,
            wakeup,
            config,
            batch_size,
            default_retry,
            active: AtomicUsize::new(0),
            slot_freed: Notify::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run until the shutdown token fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        WorkerRecord::register(
            &self.config.worker_id,
            &hostname,
            self.config.concurrency as i32,
            &self.pool,
        )
        .await?;
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker pool starting"
        );

        let heartbeat = {
            let worker = Arc::clone(&self);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(worker.config.heartbeat_interval);
                interval.tick().await; // Skip first immediate tick
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let active = worker.active.load(Ordering::SeqCst) as i32;
                            if let Err(e) = WorkerRecord::heartbeat(
                                &worker.config.worker_id,
                                active,
                                &worker.pool,
                            )
                            .await
                            {
                                warn!(error = %e, "worker heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let available = self
                .config
                .concurrency
                .saturating_sub(self.active.load(Ordering::SeqCst));
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.slot_freed.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            let batch = self.batch_size.min(available as i64);
            let tasks = match self.queue.acquire(&self.config.worker_id, batch).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "failed to acquire tasks");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if tasks.is_empty() {
                // Nothing eligible: sleep until notified or the next poll.
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for task in tasks {
                self.active.fetch_add(1, Ordering::SeqCst);
                let worker = Arc::clone(&self);
                tokio::spawn(async move {
                    let _slot = SlotGuard {
                        worker: Arc::clone(&worker),
                    };
                    worker.process_task(task).await;
                });
            }
        }

        self.drain().await;
        let _ = heartbeat.await;

        if let Err(e) =
            WorkerRecord::set_status(&self.config.worker_id, WorkerStatus::Stopped, &self.pool).await
        {
            warn!(error = %e, "failed to mark worker stopped");
        }
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    /// Stop accepting work and wait for in-flight tasks, bounded by the
    /// drain timeout. Tasks still running past the bound keep their locks
    /// and resurface through orphan reclamation.
    async fn drain(&self) {
        if let Err(e) =
            WorkerRecord::set_status(&self.config.worker_id, WorkerStatus::Draining, &self.pool).await
        {
            warn!(error = %e, "failed to mark worker draining");
        }

        let in_flight = self.active.load(Ordering::SeqCst);
        if in_flight > 0 {
            info!(count = in_flight, "draining in-flight tasks");
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(
                remaining,
                "drain timeout expired; remaining task locks will expire and be reclaimed"
            );
        }
    }

    async fn process_task(&self, task: Task) {
        // LOCKED -> RUNNING before the handler sees the task.
        let task = match self.queue.start(task.id).await {
            Ok(task) => task,
            Err(e) if e.is_lost_race() => {
                warn!(task_id = %task.id, error = %e, "task no longer claimable, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to start task");
                return;
            }
        };
        debug!(
            task_id = %task.id,
            step = %task.step_name,
            attempt = task.attempt,
            "task started"
        );

        let invocation = match self.prepare(&task).await {
            Ok(invocation) => invocation,
            Err(e) => {
                // Can't even resolve the workflow or step; the error rides
                // the normal retry/dead-letter path.
                self.report_failure(&task, &format!("failed to prepare step: {e}"), self.default_retry)
                    .await;
                return;
            }
        };

        match self.execute(&task, invocation.ctx, invocation.handler).await {
            Ok(output) => self.report_success(&task, output).await,
            Err(message) => self.report_failure(&task, &message, invocation.policy).await,
        }
    }

    /// Run the handler, enforcing the per-attempt deadline when one is set.
    async fn execute(
        &self,
        task: &Task,
        ctx: StepContext,
        handler: Arc<dyn StepHandler>,
    ) -> Result<Option<Value>, String> {
        let fut = handler.execute(ctx);
        let result = match task.timeout_ms {
            Some(ms) if ms > 0 => {
                match tokio::time::timeout(Duration::from_millis(ms as u64), fut).await {
                    Ok(result) => result,
                    Err(_) => return Err(TIMEOUT_ERROR.to_string()),
                }
            }
            _ => fut.await,
        };
        result.map_err(|e| e.to_string())
    }

    /// Persist COMPLETED first, then advance: the fan-in count must see
    /// this task as terminal before the advancer evaluates the element.
    async fn report_success(&self, task: &Task, output: Option<Value>) {
        match self.queue.complete(task.id, output.as_ref()).await {
            Ok(completed) => {
                debug!(task_id = %task.id, step = %task.step_name, "task completed");
                if let Err(e) = self.advancer.on_task_terminal(&completed).await {
                    error!(
                        execution_id = %completed.execution_id,
                        task_id = %completed.id,
                        error = %e,
                        "advancement after completion failed"
                    );
                }
            }
            Err(e) if e.is_lost_race() => {
                warn!(task_id = %task.id, error = %e, "task finished elsewhere, dropping result");
            }
            Err(e) => error!(task_id = %task.id, error = %e, "failed to record completion"),
        }
    }

    /// Report a failed attempt; the advancer only runs when the failure
    /// dead-lettered the task, so fan-in can account for it.
    async fn report_failure(&self, task: &Task, message: &str, policy: RetryPolicy) {
        warn!(
            task_id = %task.id,
            step = %task.step_name,
            attempt = task.attempt,
            error = %message,
            "task attempt failed"
        );
        match self.queue.fail(task.id, message, &policy).await {
            Ok(outcome) => {
                if outcome.is_dead_lettered() {
                    if let Err(e) = self.advancer.on_task_terminal(outcome.task()).await {
                        error!(
                            execution_id = %task.execution_id,
                            task_id = %task.id,
                            error = %e,
                            "advancement after dead-letter failed"
                        );
                    }
                }
            }
            Err(e) if e.is_lost_race() => {
                warn!(task_id = %task.id, error = %e, "task no longer in flight, failure dropped");
            }
            Err(e) => error!(task_id = %task.id, error = %e, "failed to record failure"),
        }
    }

    /// Resolve the handler, context, and policy for one attempt.
    async fn prepare(&self, task: &Task) -> Result<Invocation> {
        let execution = Execution::find_by_id(task.execution_id, &self.pool).await?;
        let definition = self
            .registry
            .get(&execution.workflow_name)
            .ok_or_else(|| crate::error::KonduitError::WorkflowNotFound(execution.workflow_name.clone()))?;
        let located = definition
            .locate(&task.step_name, task.branch_key.as_deref())
            .ok_or_else(|| crate::error::KonduitError::InvalidDefinition {
                workflow: definition.name.clone(),
                reason: format!("step '{}' not present in registered definition", task.step_name),
            })?;

        let element_index = located.element_index();
        let follows_parallel = located.is_element_entry()
            && element_index > 0
            && matches!(
                definition.elements[element_index - 1],
                WorkflowElement::Parallel { .. }
            );

        // After a parallel block the persisted input is the sibling output
        // map: expose it through the accessor and hand the handler the
        // original execution input.
        let parallel_outputs: HashMap<String, Value> = if follows_parallel {
            task.input
                .as_ref()
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };
        let input = if follows_parallel {
            execution.input.clone()
        } else {
            task.input.clone()
        };
        let previous_output = if element_index == 0 && located.is_element_entry() {
            None
        } else {
            task.input.clone()
        };

        let step = located.step();
        let ctx = StepContext {
            execution_id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            step_name: task.step_name.clone(),
            attempt: task.attempt,
            input,
            previous_output,
            execution_input: execution.input,
            parallel_outputs,
        };

        Ok(Invocation {
            ctx,
            handler: step.handler(),
            policy: step.retry_policy.unwrap_or(self.default_retry),
        })
    }
}
