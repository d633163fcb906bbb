//! Worker registration records.
//!
//! Purely informational: task safety comes from lock timeouts, not from
//! these rows. They exist so operators can see which processes are pulling
//! work and which have gone quiet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Active,
    Draining,
    Stopped,
    /// Set by the leader's scan when the heartbeat goes quiet; the worker's
    /// tasks come back through normal lock-timeout reclamation.
    Stale,
}

const WORKER_COLUMNS: &str =
    "id, status, hostname, concurrency, active_tasks, last_heartbeat_at, started_at, stopped_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub hostname: String,
    pub concurrency: i32,
    pub active_tasks: i32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// Register (or re-register) this process as an active worker.
    pub async fn register(
        id: &str,
        hostname: &str,
        concurrency: i32,
        db: impl PgExecutor<'_>,
    ) -> Result<Self> {
        let record = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO workers (id, status, hostname, concurrency)
            VALUES ($1, 'active', $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                status = 'active',
                hostname = EXCLUDED.hostname,
                concurrency = EXCLUDED.concurrency,
                active_tasks = 0,
                last_heartbeat_at = NOW(),
                started_at = NOW(),
                stopped_at = NULL
            RETURNING {WORKER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(hostname)
        .bind(concurrency)
        .fetch_one(db)
        .await?;

        Ok(record)
    }

    pub async fn find(id: &str, db: impl PgExecutor<'_>) -> Result<Option<Self>> {
        let record = sqlx::query_as::<_, Self>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(record)
    }

    pub async fn heartbeat(id: &str, active_tasks: i32, db: impl PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat_at = NOW(), active_tasks = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(active_tasks)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn set_status(id: &str, status: WorkerStatus, db: impl PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET status = $2,
                stopped_at = CASE WHEN $3 THEN NOW() ELSE stopped_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(status == WorkerStatus::Stopped)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Mark active workers whose heartbeat is older than the threshold.
    pub async fn mark_stale(stale_after_ms: i64, db: impl PgExecutor<'_>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'stale'
            WHERE status = 'active'
              AND last_heartbeat_at <= NOW() - ($1 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(stale_after_ms.to_string())
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}
