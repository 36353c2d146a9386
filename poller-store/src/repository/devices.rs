//! Devices repository
//!
//! Reads the candidate devices for a selection pass, oldest poll first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poller_core::domain::device::{Device, PollerGroup};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use crate::error::Result;

/// Repository trait for reading the device catalog
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Lists every enabled device, optionally restricted to a poller group,
    /// ordered by `last_polled` ascending with never-polled devices first
    async fn list_pollable(&self, group: Option<&PollerGroup>) -> Result<Vec<Device>>;
}

/// MySQL implementation of DeviceRepository
pub struct MySqlDeviceRepository {
    pool: MySqlPool,
}

impl MySqlDeviceRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for MySqlDeviceRepository {
    async fn list_pollable(&self, group: Option<&PollerGroup>) -> Result<Vec<Device>> {
        // UNIX_TIMESTAMP interprets DATETIME in the session time zone, which
        // is the zone the external poller writes last_polled in.
        let mut query = QueryBuilder::<MySql>::new(
            r#"
            SELECT CAST(device_id AS UNSIGNED) AS device_id,
                   CAST(UNIX_TIMESTAMP(last_polled) AS SIGNED) AS last_polled,
                   CAST(poller_group AS UNSIGNED) AS poller_group
            FROM devices
            WHERE "#,
        );

        if let Some(group) = group {
            query.push("poller_group IN (");
            let mut ids = query.separated(", ");
            for id in group.ids() {
                ids.push_bind(*id);
            }
            ids.push_unseparated(") AND ");
        }

        query.push("disabled = 0 ORDER BY last_polled ASC");

        let rows = query
            .build_query_as::<DeviceRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: u64,
    last_polled: Option<i64>,
    poller_group: Option<u64>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.device_id,
            last_polled: row
                .last_polled
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            group: row.poller_group,
            disabled: false,
        }
    }
}
