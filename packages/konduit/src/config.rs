//! Engine configuration loaded from environment variables.
//!
//! Every knob has a programmatic default so embedding processes can build a
//! config in code; `from_env` layers `KONDUIT_*` variables on top for
//! deployment tuning. Durations are expressed in milliseconds in the
//! environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use uuid::Uuid;

use crate::retry::{BackoffStrategy, RetryPolicy};

/// Top-level configuration for a Konduit process.
#[derive(Debug, Clone)]
pub struct KonduitConfig {
    /// PostgreSQL connection string (the durable store).
    pub database_url: String,
    pub database_max_connections: u32,
    /// Redis connection string for the coordination layer. `None` disables
    /// coordination; the engine degrades to polling and everyone-is-leader.
    pub redis_url: Option<String>,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub leader: LeaderConfig,
    pub execution: ExecutionConfig,
    pub retention: RetentionConfig,
    /// Retry policy applied to steps that do not declare their own.
    pub default_retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identifier for this process's worker record and task locks.
    pub worker_id: String,
    /// Maximum concurrent task executions in this process.
    pub concurrency: usize,
    /// How long the poll loop sleeps when no notification arrives.
    pub poll_interval: Duration,
    /// Heartbeat write cadence. Informational only; task safety comes from
    /// the lock timeout, not the heartbeat.
    pub heartbeat_interval: Duration,
    /// A worker with no heartbeat for this long is marked stale.
    pub stale_threshold: Duration,
    /// Upper bound on graceful shutdown.
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claimed task may hold its lock before reclamation.
    pub lock_timeout: Duration,
    /// Orphan scan cadence.
    pub reaper_interval: Duration,
    /// Tasks acquired per poll.
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// TTL of the leader lock in the coordination store.
    pub lock_ttl: Duration,
    /// Renewal cadence; must stay under half the TTL.
    pub renew_interval: Duration,
    /// Key the lock is stored under.
    pub lock_key: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Wall-clock deadline applied to executions whose workflow declares none.
    pub default_timeout: Duration,
    /// Execution-deadline scan cadence.
    pub timeout_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Terminal executions older than this are purged with their tasks and
    /// dead letters.
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            batch_size: 1,
        }
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            lock_key: "konduit:leader".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30 * 60),
            timeout_check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl KonduitConfig {
    /// Build a config for the given database with defaults everywhere else.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_max_connections: 5,
            redis_url: None,
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            leader: LeaderConfig::default(),
            execution: ExecutionConfig::default(),
            retention: RetentionConfig::default(),
            default_retry: RetryPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Exponential,
                base_delay_ms: 1_000,
                max_delay_ms: 300_000,
                jitter: false,
            },
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let mut config = Self::new(database_url);

        config.redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        config.database_max_connections =
            parse_var("KONDUIT_DB_MAX_CONNECTIONS", config.database_max_connections)?;

        if let Ok(id) = env::var("KONDUIT_WORKER_ID") {
            config.worker.worker_id = id;
        }
        config.worker.concurrency =
            parse_var("KONDUIT_WORKER_CONCURRENCY", config.worker.concurrency)?;
        config.worker.poll_interval =
            parse_millis("KONDUIT_WORKER_POLL_INTERVAL_MS", config.worker.poll_interval)?;
        config.worker.heartbeat_interval = parse_millis(
            "KONDUIT_WORKER_HEARTBEAT_INTERVAL_MS",
            config.worker.heartbeat_interval,
        )?;
        config.worker.stale_threshold = parse_millis(
            "KONDUIT_WORKER_STALE_THRESHOLD_MS",
            config.worker.stale_threshold,
        )?;
        config.worker.drain_timeout =
            parse_millis("KONDUIT_WORKER_DRAIN_TIMEOUT_MS", config.worker.drain_timeout)?;

        config.queue.lock_timeout =
            parse_millis("KONDUIT_QUEUE_LOCK_TIMEOUT_MS", config.queue.lock_timeout)?;
        config.queue.reaper_interval =
            parse_millis("KONDUIT_QUEUE_REAPER_INTERVAL_MS", config.queue.reaper_interval)?;
        config.queue.batch_size = parse_var("KONDUIT_QUEUE_BATCH_SIZE", config.queue.batch_size)?;

        config.leader.lock_ttl = parse_millis("KONDUIT_LEADER_LOCK_TTL_MS", config.leader.lock_ttl)?;
        config.leader.renew_interval =
            parse_millis("KONDUIT_LEADER_RENEW_INTERVAL_MS", config.leader.renew_interval)?;

        config.execution.default_timeout = parse_millis(
            "KONDUIT_EXECUTION_DEFAULT_TIMEOUT_MS",
            config.execution.default_timeout,
        )?;
        config.execution.timeout_check_interval = parse_millis(
            "KONDUIT_EXECUTION_TIMEOUT_CHECK_INTERVAL_MS",
            config.execution.timeout_check_interval,
        )?;

        config.retention.ttl = parse_millis("KONDUIT_RETENTION_TTL_MS", config.retention.ttl)?;
        config.retention.sweep_interval = parse_millis(
            "KONDUIT_RETENTION_SWEEP_INTERVAL_MS",
            config.retention.sweep_interval,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.worker.concurrency >= 1,
            "worker concurrency must be at least 1"
        );
        anyhow::ensure!(self.queue.batch_size >= 1, "queue batch size must be at least 1");
        anyhow::ensure!(
            self.leader.renew_interval * 2 < self.leader.lock_ttl,
            "leader renew interval must be less than half the lock TTL"
        );
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration> {
    let millis: u64 = parse_var(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = KonduitConfig::new("postgres://localhost/konduit");
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.worker.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.worker.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.queue.lock_timeout, Duration::from_secs(300));
        assert_eq!(config.queue.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.queue.batch_size, 1);
        assert_eq!(config.leader.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.leader.renew_interval, Duration::from_secs(10));
        assert_eq!(config.execution.default_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn default_step_retry_is_exponential_doubling() {
        let config = KonduitConfig::new("postgres://localhost/konduit");
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.default_retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.default_retry.base_delay_ms, 1_000);
        assert_eq!(config.default_retry.max_delay_ms, 300_000);
    }

    #[test]
    fn worker_id_defaults_to_unique_value() {
        let a = WorkerConfig::default();
        let b = WorkerConfig::default();
        assert!(a.worker_id.starts_with("worker-"));
        assert_ne!(a.worker_id, b.worker_id);
    }

    #[test]
    fn validate_rejects_slow_leader_renewal() {
        let mut config = KonduitConfig::new("postgres://localhost/konduit");
        config.leader.renew_interval = Duration::from_secs(20);
        assert!(config.validate().is_err());
    }
}
