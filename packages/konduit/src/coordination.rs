//! Coordination layer: push notification of new tasks and best-effort
//! leader election.
//!
//! Both capabilities are conveniences, not safety properties. Polling is
//! the correctness baseline for workers, and every leader-gated job is
//! idempotent, so when the coordination store is unreachable or
//! unconfigured the engine substitutes no-op implementations and keeps
//! running with higher latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderConfig;

const TASK_CHANNEL: &str = "konduit:tasks";

/// Fire-and-forget push that new tasks exist. Failures are logged, never
/// surfaced: dispatchers must not fail because the wakeup channel did.
#[async_trait::async_trait]
pub trait TaskNotifier: Send + Sync {
    async fn notify_tasks_available(&self);
}

/// Best-effort distributed leader lock.
#[async_trait::async_trait]
pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> bool;
    async fn leader_id(&self) -> Option<String>;
}

/// No-op notifier: workers fall back to their poll interval.
pub struct NoopNotifier;

#[async_trait::async_trait]
impl TaskNotifier for NoopNotifier {
    async fn notify_tasks_available(&self) {}
}

/// No-op election: everyone is leader. Safe because leader-gated jobs are
/// idempotent; gating only avoids duplicate work.
pub struct NoopLeaderElection;

#[async_trait::async_trait]
impl LeaderElection for NoopLeaderElection {
    fn is_leader(&self) -> bool {
        true
    }

    async fn leader_id(&self) -> Option<String> {
        None
    }
}

/// Publishes task wakeups over Redis PUB/SUB.
pub struct RedisNotifier {
    conn: ConnectionManager,
}

#[async_trait::async_trait]
impl TaskNotifier for RedisNotifier {
    async fn notify_tasks_available(&self) {
        let mut conn = self.conn.clone();
        let published: redis::RedisResult<i64> = conn.publish(TASK_CHANNEL, 1).await;
        if let Err(e) = published {
            warn!(error = %e, "task notification publish failed");
        }
    }
}

/// `SET NX PX` leader lock with scripted compare-and-expire renewal.
///
/// The renewal script extends the TTL only while the lock still holds this
/// worker's id; when the check fails the instance relinquishes leadership
/// and goes back to periodic acquisition attempts.
pub struct RedisLeaderElection {
    conn: ConnectionManager,
    key: String,
    holder_id: String,
    ttl: Duration,
    leading: AtomicBool,
}

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

impl RedisLeaderElection {
    pub fn new(conn: ConnectionManager, key: String, holder_id: String, ttl: Duration) -> Self {
        Self {
            conn,
            key,
            holder_id,
            ttl,
            leading: AtomicBool::new(false),
        }
    }

    /// Renewal loop. Runs until the shutdown token fires, then releases
    /// the lock if held.
    pub async fn run(self: Arc<Self>, renew_interval: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(renew_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release().await;
                    break;
                }
                _ = interval.tick() => self.acquire_or_renew().await,
            }
        }
    }

    async fn acquire_or_renew(&self) {
        let mut conn = self.conn.clone();
        let ttl_ms = self.ttl.as_millis() as i64;

        if self.leading.load(Ordering::SeqCst) {
            let renewed: redis::RedisResult<i64> = redis::Script::new(RENEW_SCRIPT)
                .key(&self.key)
                .arg(&self.holder_id)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await;
            match renewed {
                Ok(1) => debug!(key = %self.key, "leader lock renewed"),
                Ok(_) => {
                    self.leading.store(false, Ordering::SeqCst);
                    warn!(key = %self.key, "leadership lost, lock held elsewhere");
                }
                Err(e) => {
                    self.leading.store(false, Ordering::SeqCst);
                    warn!(error = %e, "leader renewal failed, relinquishing");
                }
            }
        } else {
            let acquired: redis::RedisResult<Option<String>> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.holder_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;
            match acquired {
                Ok(Some(_)) => {
                    self.leading.store(true, Ordering::SeqCst);
                    info!(key = %self.key, holder = %self.holder_id, "leadership acquired");
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "leader acquisition attempt failed"),
            }
        }
    }

    async fn release(&self) {
        if !self.leading.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut conn = self.conn.clone();
        let released: redis::RedisResult<i64> = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.holder_id)
            .invoke_async(&mut conn)
            .await;
        match released {
            Ok(_) => info!(key = %self.key, "leader lock released"),
            Err(e) => warn!(error = %e, "leader lock release failed, TTL will expire it"),
        }
    }
}

#[async_trait::async_trait]
impl LeaderElection for RedisLeaderElection {
    fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    async fn leader_id(&self) -> Option<String> {
        let mut conn = self.conn.clone();
        let holder: redis::RedisResult<Option<String>> = conn.get(&self.key).await;
        holder.ok().flatten()
    }
}

/// The wired coordination capabilities handed to the rest of the engine.
pub struct Coordination {
    pub notifier: Arc<dyn TaskNotifier>,
    /// Woken whenever a task notification arrives; workers select on this
    /// against their poll timer.
    pub wakeup: Arc<Notify>,
    pub election: Arc<dyn LeaderElection>,
}

impl Coordination {
    /// The degraded mode: no pushes, everyone is leader.
    pub fn disabled() -> Self {
        Self {
            notifier: Arc::new(NoopNotifier),
            wakeup: Arc::new(Notify::new()),
            election: Arc::new(NoopLeaderElection),
        }
    }

    /// Connect to the coordination store, spawning the subscriber and
    /// leader-renewal loops. Any failure degrades to no-op with a warning;
    /// coordination trouble is never fatal.
    pub async fn connect(
        redis_url: &str,
        worker_id: &str,
        leader: &LeaderConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        match Self::try_connect(redis_url, worker_id, leader, shutdown).await {
            Ok(coordination) => coordination,
            Err(e) => {
                warn!(error = %e, "coordination store unavailable, degrading to no-op");
                Self::disabled()
            }
        }
    }

    async fn try_connect(
        redis_url: &str,
        worker_id: &str,
        leader: &LeaderConfig,
        shutdown: &CancellationToken,
    ) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        // Verify the store is actually reachable before wiring anything.
        let mut ping_conn = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut ping_conn).await?;
        info!("connected to coordination store");

        let wakeup = Arc::new(Notify::new());
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(TASK_CHANNEL).await?;
        tokio::spawn(subscriber_loop(pubsub, Arc::clone(&wakeup), shutdown.clone()));

        let election = Arc::new(RedisLeaderElection::new(
            conn.clone(),
            leader.lock_key.clone(),
            worker_id.to_string(),
            leader.lock_ttl,
        ));
        tokio::spawn(Arc::clone(&election).run(leader.renew_interval, shutdown.clone()));

        Ok(Self {
            notifier: Arc::new(RedisNotifier { conn }),
            wakeup,
            election,
        })
    }
}

async fn subscriber_loop(
    mut pubsub: redis::aio::PubSub,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = stream.next() => match message {
                Some(_) => wakeup.notify_waiters(),
                None => {
                    warn!("task notification subscription closed");
                    break;
                }
            }
        }
    }
}
