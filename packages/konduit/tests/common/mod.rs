//! Shared test harness.
//!
//! One PostgreSQL container is shared across the test binary; every test
//! gets its own database inside it, with migrations applied, so tests are
//! isolated and can run concurrently.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use konduit::model::{Execution, ExecutionStatus, StepType, Task};
use konduit::{
    Konduit, KonduitConfig, RetryPolicy, StepContext, StepHandler,
};

struct SharedPg {
    base_url: String,
    /// Held to keep the container alive for the whole test binary.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    // An externally provided server (CI setup script) takes precedence.
    if let Ok(url) = std::env::var("KONDUIT_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Install a subscriber so `RUST_LOG=konduit=debug` works in tests.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a uniquely named database with migrations applied.
///
/// Returns `(pool, database_url, db_name)`; call [`drop_test_db`] with the
/// name when done.
pub async fn create_test_db() -> (PgPool, String, String) {
    init_tracing();
    let base_url = pg_url().await;

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database");

    let db_name = format!("konduit_test_{}", Uuid::new_v4().simple());
    maint_pool
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let database_url = format!("{base_url}/{db_name}");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    konduit::store::MIGRATOR
        .run(&pool)
        .await
        .expect("migrations should succeed");

    (pool, database_url, db_name)
}

pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database");

    let _ = maint_pool
        .execute(
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
            )
            .as_str(),
        )
        .await;
    let _ = maint_pool
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint_pool.close().await;
}

/// Engine configuration tuned for fast tests: tight polling, short drain,
/// no coordination store.
pub fn test_config(database_url: &str) -> KonduitConfig {
    let mut config = KonduitConfig::new(database_url);
    config.worker.poll_interval = Duration::from_millis(50);
    config.worker.drain_timeout = Duration::from_secs(2);
    config.worker.heartbeat_interval = Duration::from_millis(500);
    config.queue.batch_size = 5;
    config.queue.reaper_interval = Duration::from_millis(200);
    config.execution.timeout_check_interval = Duration::from_millis(100);
    config.default_retry = RetryPolicy {
        max_attempts: 3,
        strategy: konduit::BackoffStrategy::Fixed,
        base_delay_ms: 25,
        max_delay_ms: 1_000,
        jitter: false,
    };
    config
}

/// Connect and start an engine against a fresh database.
pub async fn start_engine(database_url: &str) -> Konduit {
    let engine = Konduit::connect(test_config(database_url))
        .await
        .expect("engine should connect");
    engine.start().await.expect("engine should start");
    engine
}

/// Poll until the execution reaches a terminal status.
pub async fn wait_for_terminal(engine: &Konduit, execution_id: Uuid) -> Execution {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let execution = engine
            .execution(execution_id)
            .await
            .expect("execution should exist");
        if execution.status.is_terminal() {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {execution_id} did not reach a terminal status in time (status {:?})",
            execution.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---- Row fixtures for queue-level tests ----

/// Insert a RUNNING execution to own fixture tasks.
pub async fn seed_execution(pool: &PgPool) -> Execution {
    let mut execution = Execution::builder()
        .workflow_name("fixture")
        .workflow_version(1)
        .build();
    execution.status = ExecutionStatus::Running;
    execution.insert(pool).await.expect("execution fixture")
}

/// Insert a PENDING sequential task ready for acquisition.
pub async fn seed_task(pool: &PgPool, execution_id: Uuid, step_name: &str, max_attempts: i32) -> Task {
    let task = Task::builder()
        .execution_id(execution_id)
        .step_name(step_name)
        .step_type(StepType::Sequential)
        .step_order(0)
        .max_attempts(max_attempts)
        .build();
    task.insert(pool).await.expect("task fixture")
}

// ---- Handlers ----

/// Returns a fixed value.
pub fn static_handler(value: Value) -> Arc<dyn StepHandler> {
    konduit::handler_fn(move |_| Ok(Some(value.clone())))
}

/// Fails the first `failures` attempts, then returns `value`.
pub struct FlakyHandler {
    failures: i32,
    value: Value,
    calls: AtomicI32,
}

impl FlakyHandler {
    pub fn new(failures: i32, value: Value) -> Arc<Self> {
        Arc::new(Self {
            failures,
            value,
            calls: AtomicI32::new(0),
        })
    }

    pub fn calls(&self) -> i32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StepHandler for FlakyHandler {
    async fn execute(&self, _ctx: StepContext) -> anyhow::Result<Option<Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("induced failure #{call}");
        }
        Ok(Some(self.value.clone()))
    }
}

/// Always fails.
pub fn failing_handler(message: &'static str) -> Arc<dyn StepHandler> {
    konduit::handler_fn(move |_| anyhow::bail!(message))
}

/// Sleeps, then returns its input.
pub struct SlowHandler(pub Duration);

#[async_trait::async_trait]
impl StepHandler for SlowHandler {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<Option<Value>> {
        tokio::time::sleep(self.0).await;
        Ok(ctx.input)
    }
}

/// Records the context it was invoked with.
pub struct CapturingHandler {
    pub seen: std::sync::Mutex<Vec<StepContext>>,
    value: Value,
}

impl CapturingHandler {
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            seen: std::sync::Mutex::new(Vec::new()),
            value,
        })
    }

    pub fn contexts(&self) -> Vec<StepContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StepHandler for CapturingHandler {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<Option<Value>> {
        self.seen.lock().unwrap().push(ctx);
        Ok(Some(self.value.clone()))
    }
}
