//! PostgreSQL implementation of the Superplane [`Store`](superplane::Store) and
//! [`PolicyStore`](superplane::PolicyStore).
//!
//! # Features
//!
//! - Every multi-row state change runs in one transaction
//! - Dispatch claims with `FOR UPDATE SKIP LOCKED` and expiring leases
//! - Exponential redispatch backoff (2^attempt seconds)
//! - One active execution per stage enforced by a partial unique index
//! - Per-stage leases so only one worker evaluates a stage's gates
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql`. The constraints that carry meaning:
//!
//! ```sql
//! CREATE UNIQUE INDEX executions_one_active_per_stage ON executions (stage_id)
//!     WHERE state IN ('pending', 'started');
//! CREATE INDEX stage_events_queue_idx ON stage_events (stage_id, created_at, id)
//!     WHERE state = 'pending';
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use superplane_postgres::{PgPolicyStore, PgStore};
//!
//! let store = PgStore::connect("postgres://localhost/superplane", 10).await?;
//! store.migrate().await?;
//! let policies = PgPolicyStore::new(store.pool().clone());
//!
//! let core = CoreBuilder::new(Arc::new(store), Arc::new(policies), encryptor, secret)
//!     .build()
//!     .await?;
//! ```

mod error;
mod policy;
mod rows;
mod store;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use superplane::error::{Error, Result};

pub use policy::PgPolicyStore;

use crate::error::DbResultExt;

/// PostgreSQL store implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .db()?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Config(format!("migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Utility functions for operating the pipeline.
impl PgStore {
    /// Release stage leases whose holder stopped renewing them.
    pub async fn reclaim_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stage_leases WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .db()?;
        Ok(result.rows_affected())
    }

    /// Get counts describing pipeline backlog.
    pub async fn stats(&self) -> Result<PipelineStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM events WHERE state = 'pending') AS pending_events,
                (SELECT COUNT(*) FROM stage_events WHERE state = 'pending') AS pending_stage_events,
                (SELECT COUNT(*) FROM stage_events WHERE state = 'waiting') AS waiting_stage_events,
                (SELECT COUNT(*) FROM executions WHERE state = 'pending') AS pending_executions,
                (SELECT COUNT(*) FROM executions WHERE state = 'started') AS started_executions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .db()?;

        Ok(PipelineStats {
            pending_events: row.try_get("pending_events").db()?,
            pending_stage_events: row.try_get("pending_stage_events").db()?,
            waiting_stage_events: row.try_get("waiting_stage_events").db()?,
            pending_executions: row.try_get("pending_executions").db()?,
            started_executions: row.try_get("started_executions").db()?,
        })
    }
}

/// Pipeline backlog counts.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PipelineStats {
    pub pending_events: i64,
    pub pending_stage_events: i64,
    pub waiting_stage_events: i64,
    pub pending_executions: i64,
    pub started_executions: i64,
}
