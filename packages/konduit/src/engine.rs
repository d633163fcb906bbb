//! The engine facade: registration, triggering, and lifecycle wiring.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::advancer::ExecutionAdvancer;
use crate::config::KonduitConfig;
use crate::coordination::{Coordination, LeaderElection, TaskNotifier};
use crate::dispatcher::TaskDispatcher;
use crate::error::{KonduitError, Result};
use crate::maintenance::Maintenance;
use crate::model::{DeadLetter, Execution, ExecutionStatus, Task};
use crate::queue::TaskQueue;
use crate::store;
use crate::worker::WorkerPool;
use crate::workflow::{WorkflowDefinition, WorkflowRegistry};

/// A wired Konduit engine.
///
/// `connect` builds the component graph against the durable store,
/// `register` installs workflow definitions, `start` launches the worker
/// pool and background jobs, and `trigger` submits executions.
pub struct Konduit {
    pool: PgPool,
    config: KonduitConfig,
    registry: Arc<WorkflowRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: TaskDispatcher,
    advancer: Arc<ExecutionAdvancer>,
    notifier: Arc<dyn TaskNotifier>,
    wakeup: Arc<Notify>,
    election: Arc<dyn LeaderElection>,
    shutdown: CancellationToken,
    services: Mutex<Vec<JoinHandle<()>>>,
}

impl Konduit {
    /// Connect to the stores, apply migrations, and wire the components.
    /// Background services do not run until [`Konduit::start`].
    pub async fn connect(config: KonduitConfig) -> Result<Self> {
        let pool = store::connect(&config).await?;
        store::migrate(&pool).await?;

        let shutdown = CancellationToken::new();
        let coordination = match config.redis_url.as_deref() {
            Some(url) => {
                Coordination::connect(url, &config.worker.worker_id, &config.leader, &shutdown).await
            }
            None => {
                info!("coordination store not configured, running in poll-only mode");
                Coordination::disabled()
            }
        };

        let registry = Arc::new(WorkflowRegistry::new());
        let queue = Arc::new(TaskQueue::new(pool.clone(), config.queue.lock_timeout));
        let dispatcher = TaskDispatcher::new(config.default_retry);
        let advancer = Arc::new(ExecutionAdvancer::new(
            pool.clone(),
            Arc::clone(&registry),
            TaskDispatcher::new(config.default_retry),
            Arc::clone(&coordination.notifier),
        ));

        Ok(Self {
            pool,
            config,
            registry,
            queue,
            dispatcher,
            advancer,
            notifier: coordination.notifier,
            wakeup: coordination.wakeup,
            election: coordination.election,
            shutdown,
            services: Mutex::new(Vec::new()),
        })
    }

    /// Validate and install a workflow definition, persisting its shape to
    /// the `workflows` table. Registering the same name again replaces the
    /// in-process definition.
    pub async fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, version, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, version) DO UPDATE SET
                definition = EXCLUDED.definition,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&definition.name)
        .bind(definition.version)
        .bind(definition.descriptor())
        .execute(&self.pool)
        .await?;

        info!(
            workflow = %definition.name,
            version = definition.version,
            "workflow registered"
        );
        self.registry.insert(definition);
        Ok(())
    }

    /// Launch the worker pool and maintenance jobs.
    pub async fn start(&self) -> Result<()> {
        let worker = Arc::new(WorkerPool::new(
            self.pool.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.advancer),
            Arc::clone(&self.wakeup),
            self.config.worker.clone(),
            self.config.queue.batch_size,
            self.config.default_retry,
        ));
        let worker_token = self.shutdown.child_token();
        let worker_handle = tokio::spawn(async move {
            if let Err(e) = worker.run(worker_token).await {
                error!(error = %e, "worker pool exited with error");
            }
        });

        let maintenance = Arc::new(Maintenance::new(
            self.pool.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.election),
            self.config.clone(),
        ));
        let maintenance_handle = tokio::spawn(maintenance.run(self.shutdown.child_token()));

        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        services.push(worker_handle);
        services.push(maintenance_handle);
        Ok(())
    }

    /// Submit an execution of a registered workflow.
    ///
    /// When `idempotency_key` matches an existing execution, that
    /// execution's id is returned and nothing new is created.
    pub async fn trigger(
        &self,
        workflow_name: &str,
        input: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Uuid> {
        let definition = self
            .registry
            .get(workflow_name)
            .ok_or_else(|| KonduitError::WorkflowNotFound(workflow_name.to_string()))?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = Execution::find_by_idempotency_key(key, &self.pool).await? {
                debug!(
                    execution_id = %existing.id,
                    idempotency_key = key,
                    "trigger deduplicated by idempotency key"
                );
                return Ok(existing.id);
            }
        }

        let timeout = definition
            .timeout
            .unwrap_or(self.config.execution.default_timeout);
        let deadline = Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64);

        let mut execution = Execution::builder()
            .workflow_name(definition.name.clone())
            .workflow_version(definition.version)
            .build();
        execution.input = input;
        execution.idempotency_key = idempotency_key.map(str::to_string);
        execution.deadline_at = Some(deadline);

        let mut tx = self.pool.begin().await?;
        let inserted = match execution.insert(&mut *tx).await {
            Ok(inserted) => inserted,
            Err(KonduitError::Database(sqlx::Error::Database(db)))
                if db.is_unique_violation() && idempotency_key.is_some() =>
            {
                // Concurrent trigger with the same key won the insert.
                drop(tx);
                let key = idempotency_key.unwrap_or_default();
                let existing = Execution::find_by_idempotency_key(key, &self.pool)
                    .await?
                    .ok_or(KonduitError::Database(sqlx::Error::RowNotFound))?;
                return Ok(existing.id);
            }
            Err(e) => return Err(e),
        };

        let running =
            Execution::transition(&mut tx, inserted.id, ExecutionStatus::Running, None, None)
                .await?;

        match self
            .dispatcher
            .dispatch_element(&mut tx, &running, &definition, 0, running.input.as_ref())
            .await
        {
            Ok(_) => {
                tx.commit().await?;
                self.notifier.notify_tasks_available().await;
            }
            Err(KonduitError::NoBranchMatched { selector, .. }) => {
                let error = format!("no branch arm matched selector {selector:?}");
                Execution::transition(
                    &mut tx,
                    running.id,
                    ExecutionStatus::Failed,
                    Some(&error),
                    None,
                )
                .await?;
                tx.commit().await?;
            }
            Err(e) => return Err(e),
        }

        info!(
            execution_id = %running.id,
            workflow = workflow_name,
            "execution triggered"
        );
        Ok(running.id)
    }

    /// Cancel a pending or running execution. In-flight tasks run to
    /// completion and report normally; advancement stops at the terminal
    /// status.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<Execution> {
        let mut conn = self.pool.acquire().await?;
        let cancelled = Execution::transition(
            &mut conn,
            execution_id,
            ExecutionStatus::Cancelled,
            Some("cancelled by operator"),
            None,
        )
        .await?;
        info!(execution_id = %execution_id, "execution cancelled");
        Ok(cancelled)
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<Execution> {
        Execution::find_by_id(execution_id, &self.pool).await
    }

    /// Tasks of an execution in dispatch order.
    pub async fn execution_tasks(&self, execution_id: Uuid) -> Result<Vec<Task>> {
        Task::find_by_execution(execution_id, &self.pool).await
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        DeadLetter::list(limit, &self.pool).await
    }

    /// Requeue a dead-lettered task and wake the workers.
    pub async fn reprocess_dead_letter(&self, task_id: Uuid) -> Result<Task> {
        let task = self.queue.reprocess_dead_letter(task_id).await?;
        self.notifier.notify_tasks_available().await;
        Ok(task)
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &KonduitConfig {
        &self.config
    }

    /// Signal shutdown and wait for the services to drain and stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            services.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("konduit engine stopped");
    }
}
