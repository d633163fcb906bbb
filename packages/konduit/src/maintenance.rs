//! Background jobs: orphan reclamation, execution timeouts, stale-worker
//! marking, and retention.
//!
//! Every job is idempotent, so running them on multiple instances is safe;
//! leader gating on the slower scans only avoids duplicate effort. The
//! reclaimer and timeout checker run everywhere; a task can be stuck for
//! at most `lock_timeout + reaper_interval`.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::KonduitConfig;
use crate::coordination::LeaderElection;
use crate::error::Result;
use crate::model::{Execution, ExecutionStatus, WorkerRecord};
use crate::queue::TaskQueue;

pub struct Maintenance {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    election: Arc<dyn LeaderElection>,
    config: KonduitConfig,
}

impl Maintenance {
    pub fn new(
        pool: PgPool,
        queue: Arc<TaskQueue>,
        election: Arc<dyn LeaderElection>,
        config: KonduitConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            election,
            config,
        }
    }

    /// Run all periodic jobs until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut reaper = tokio::time::interval(self.config.queue.reaper_interval);
        let mut timeouts = tokio::time::interval(self.config.execution.timeout_check_interval);
        let mut stale = tokio::time::interval(self.config.worker.stale_threshold);
        let mut retention = tokio::time::interval(self.config.retention.sweep_interval);
        // Skip the immediate first tick of each interval.
        reaper.tick().await;
        timeouts.tick().await;
        stale.tick().await;
        retention.tick().await;

        info!("maintenance jobs started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reaper.tick() => {
                    if let Err(e) = self.queue.reclaim_orphans().await {
                        error!(error = %e, "orphan reclamation failed");
                    }
                }
                _ = timeouts.tick() => {
                    if let Err(e) = self.check_execution_timeouts().await {
                        error!(error = %e, "execution timeout check failed");
                    }
                }
                _ = stale.tick() => {
                    if self.election.is_leader() {
                        if let Err(e) = self.mark_stale_workers().await {
                            error!(error = %e, "stale worker scan failed");
                        }
                    }
                }
                _ = retention.tick() => {
                    if self.election.is_leader() {
                        if let Err(e) = self.purge_expired().await {
                            error!(error = %e, "retention purge failed");
                        }
                    }
                }
            }
        }
        info!("maintenance jobs stopped");
    }

    /// Drive RUNNING executions past their deadline to TIMED_OUT.
    ///
    /// In-flight tasks are not cancelled; they finish or dead-letter
    /// normally, and the terminal execution status blocks any further
    /// advancement.
    pub async fn check_execution_timeouts(&self) -> Result<u64> {
        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM executions
            WHERE status = 'running'
              AND deadline_at IS NOT NULL
              AND deadline_at <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut timed_out = 0;
        for id in expired {
            let mut conn = self.pool.acquire().await?;
            match Execution::transition(
                &mut conn,
                id,
                ExecutionStatus::TimedOut,
                Some("execution deadline exceeded"),
                None,
            )
            .await
            {
                Ok(_) => {
                    warn!(execution_id = %id, "execution timed out");
                    timed_out += 1;
                }
                // Lost race: the execution reached another terminal status
                // between scan and update.
                Err(e) if e.is_lost_race() => {
                    debug!(execution_id = %id, "execution finished before timeout transition")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(timed_out)
    }

    /// Mark workers whose heartbeat went quiet. Their tasks come back via
    /// normal lock-timeout reclamation; this only updates the record.
    pub async fn mark_stale_workers(&self) -> Result<u64> {
        let stale_after_ms = self.config.worker.stale_threshold.as_millis() as i64;
        let marked = WorkerRecord::mark_stale(stale_after_ms, &self.pool).await?;
        if marked > 0 {
            warn!(count = marked, "marked stale workers");
        }
        Ok(marked)
    }

    /// Purge terminal executions older than the retention TTL; tasks and
    /// dead letters go with them through the cascading foreign keys.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::milliseconds(self.config.retention.ttl.as_millis() as i64);
        let result = sqlx::query(
            r#"
            DELETE FROM executions
            WHERE status IN ('completed', 'failed', 'cancelled', 'timed_out')
              AND completed_at IS NOT NULL
              AND completed_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(count = purged, "purged expired executions");
        }
        Ok(purged)
    }
}
