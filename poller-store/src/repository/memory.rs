//! In-memory repositories
//!
//! A process-local catalog and lock namespace with the same semantics as the
//! MySQL implementations. Several [`MemoryLockSession`]s opened on one
//! [`MemoryLockSpace`] behave like separate database sessions, which is how
//! multiple scheduler instances are simulated in a single test.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poller_core::domain::device::{Device, DeviceId, PollerGroup};
use poller_core::domain::run::RunSummary;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::repository::devices::DeviceRepository;
use crate::repository::locks::LockRepository;
use crate::repository::pollers::{PollerRepository, UpsertOutcome};

/// Device catalog and summary table kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
    summaries: Arc<RwLock<HashMap<String, RunSummary>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices.into_iter().map(|d| (d.id, d)).collect();
        Self {
            devices: Arc::new(RwLock::new(devices)),
            summaries: Arc::default(),
        }
    }

    pub async fn insert(&self, device: Device) {
        self.devices.write().await.insert(device.id, device);
    }

    pub async fn device(&self, id: DeviceId) -> Option<Device> {
        self.devices.read().await.get(&id).cloned()
    }

    /// Records a successful poll, as the external poller does
    pub async fn mark_polled(&self, id: DeviceId, at: DateTime<Utc>) {
        if let Some(device) = self.devices.write().await.get_mut(&id) {
            device.last_polled = Some(at);
        }
    }

    /// All persisted summaries, sorted by poller name
    pub async fn summaries(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> =
            self.summaries.read().await.values().cloned().collect();
        summaries.sort_by(|a, b| a.poller_name.cmp(&b.poller_name));
        summaries
    }
}

#[async_trait]
impl DeviceRepository for MemoryCatalog {
    async fn list_pollable(&self, group: Option<&PollerGroup>) -> Result<Vec<Device>> {
        let devices = self.devices.read().await;

        let mut pollable: Vec<Device> = devices
            .values()
            .filter(|d| !d.disabled)
            .filter(|d| group.is_none_or(|g| g.contains(d.group)))
            .cloned()
            .collect();

        // None sorts before Some, so never-polled devices come first
        pollable.sort_by_key(|d| (d.last_polled, d.id));
        Ok(pollable)
    }
}

#[async_trait]
impl PollerRepository for MemoryCatalog {
    async fn upsert_summary(&self, summary: &RunSummary) -> Result<UpsertOutcome> {
        let mut summaries = self.summaries.write().await;
        let previous = summaries.insert(summary.poller_name.clone(), summary.clone());

        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }
}

/// Shared lock namespace, the in-memory counterpart of the database server
#[derive(Debug, Clone, Default)]
pub struct MemoryLockSpace {
    locks: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl MemoryLockSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session on this namespace
    pub fn session(&self) -> MemoryLockSession {
        MemoryLockSession {
            space: self.clone(),
            id: Uuid::new_v4(),
            severed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn is_held(&self, name: &str) -> bool {
        self.locks.lock().await.contains_key(name)
    }

    /// Number of locks currently held by any session
    pub async fn held_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// One session on a [`MemoryLockSpace`]
///
/// Like a MySQL session it may re-acquire a lock it already holds.
#[derive(Debug, Clone)]
pub struct MemoryLockSession {
    space: MemoryLockSpace,
    id: Uuid,
    severed: Arc<AtomicBool>,
}

impl MemoryLockSession {
    /// Simulates losing the connection: every later call fails
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    fn check_connected(&self, name: &str) -> Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(StoreError::lock(name, "connection lost"));
        }
        Ok(())
    }

    async fn try_lock_once(&self, name: &str) -> bool {
        let mut locks = self.space.locks.lock().await;
        match locks.get(name) {
            Some(owner) => *owner == self.id,
            None => {
                locks.insert(name.to_string(), self.id);
                true
            }
        }
    }
}

#[async_trait]
impl LockRepository for MemoryLockSession {
    async fn is_free(&self, name: &str) -> Result<bool> {
        self.check_connected(name)?;
        Ok(!self.space.locks.lock().await.contains_key(name))
    }

    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        self.check_connected(name)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.try_lock_once(name).await {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn release(&self, name: &str) -> Result<bool> {
        self.check_connected(name)?;
        let mut locks = self.space.locks.lock().await;

        match locks.get(name) {
            Some(owner) if *owner == self.id => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
