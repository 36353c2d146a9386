//! Pollers repository
//!
//! Persists one summary row per scheduler instance in the `pollers` table.

use async_trait::async_trait;
use poller_core::domain::run::RunSummary;
use sqlx::MySqlPool;
use tracing::debug;

use crate::error::Result;

/// What an upsert did to the summary table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated,
    Inserted,
}

/// Repository trait for run summaries
#[async_trait]
pub trait PollerRepository: Send + Sync {
    /// Updates the row of `summary.poller_name`, inserting it if missing
    async fn upsert_summary(&self, summary: &RunSummary) -> Result<UpsertOutcome>;
}

/// MySQL implementation of PollerRepository
pub struct MySqlPollerRepository {
    pool: MySqlPool,
}

impl MySqlPollerRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PollerRepository for MySqlPollerRepository {
    async fn upsert_summary(&self, summary: &RunSummary) -> Result<UpsertOutcome> {
        // last_polled uses the server clock like every other timestamp the
        // external poller writes.
        let result = sqlx::query(
            r#"
            UPDATE pollers
            SET last_polled = NOW(), devices = ?, time_taken = ?
            WHERE poller_name = ?
            "#,
        )
        .bind(summary.devices_polled)
        .bind(summary.time_taken)
        .bind(&summary.poller_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(UpsertOutcome::Updated);
        }

        debug!("No summary row for {}, inserting one", summary.poller_name);

        sqlx::query(
            r#"
            INSERT INTO pollers (poller_name, last_polled, devices, time_taken)
            VALUES (?, NOW(), ?, ?)
            "#,
        )
        .bind(&summary.poller_name)
        .bind(summary.devices_polled)
        .bind(summary.time_taken)
        .execute(&self.pool)
        .await?;

        Ok(UpsertOutcome::Inserted)
    }
}
