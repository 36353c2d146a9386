//! Named lock repository
//!
//! Advisory locks shared by all scheduler instances and the external poller.
//! A lock is identified by its name only; it is not tied to any row.

use async_trait::async_trait;
use sqlx::MySqlConnection;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Repository trait for named advisory locks
///
/// Locks are owned by the session of the implementation: only the session
/// that acquired a lock can release it.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Whether nobody, this session included, holds the lock
    async fn is_free(&self, name: &str) -> Result<bool>;

    /// Tries to take the lock, waiting up to `timeout` for it
    ///
    /// A zero timeout makes this a non-blocking attempt.
    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<bool>;

    /// Releases a lock held by this session
    ///
    /// Returns `false` if the lock was not held by this session.
    async fn release(&self, name: &str) -> Result<bool>;
}

/// MySQL implementation of LockRepository
///
/// Uses `IS_FREE_LOCK`, `GET_LOCK` and `RELEASE_LOCK` on one dedicated
/// connection, since MySQL ties named locks to the session holding them.
pub struct MySqlLockRepository {
    connection: Mutex<MySqlConnection>,
}

impl MySqlLockRepository {
    pub fn new(connection: MySqlConnection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }
}

#[async_trait]
impl LockRepository for MySqlLockRepository {
    async fn is_free(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection.lock().await;

        let free: Option<i64> = sqlx::query_scalar("SELECT IS_FREE_LOCK(?)")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;

        match free {
            Some(free) => Ok(free == 1),
            None => Err(StoreError::lock(name, "IS_FREE_LOCK returned NULL")),
        }
    }

    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        let mut conn = self.connection.lock().await;

        let timeout_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(name)
            .bind(timeout_secs)
            .fetch_one(&mut *conn)
            .await?;

        match acquired {
            Some(acquired) => Ok(acquired == 1),
            None => Err(StoreError::lock(name, "GET_LOCK returned NULL")),
        }
    }

    async fn release(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection.lock().await;

        let released: Option<i64> = sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;

        match released {
            Some(released) => Ok(released == 1),
            None => {
                debug!("Lock {} does not exist", name);
                Ok(false)
            }
        }
    }
}
