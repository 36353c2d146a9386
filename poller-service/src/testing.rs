//! Test doubles shared by the scheduler and run tests

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use poller_core::domain::device::{Device, DeviceId};
use poller_core::domain::lock::LockPurpose;
use poller_store::repository::{LockRepository, MemoryCatalog, MemoryLockSpace};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::service::PollRunner;

/// A device last polled `seconds` ago
pub fn aged(id: DeviceId, seconds: i64) -> Device {
    Device::new(id, Some(Utc::now() - TimeDelta::seconds(seconds)))
}

/// Stands in for the external poller
///
/// Like the real one it takes the device's `polling` lock for the duration
/// of the poll and advances `last_polled` on success. Any poll that finds
/// the device already being polled is counted as an overlap.
pub struct SimulatedPoller {
    catalog: MemoryCatalog,
    locks: MemoryLockSpace,
    delay: Duration,
    delays: HashMap<DeviceId, Duration>,
    failing: HashSet<DeviceId>,
    in_flight: Mutex<HashSet<DeviceId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    overlaps: AtomicUsize,
    polled: Mutex<Vec<(DeviceId, Instant)>>,
}

impl SimulatedPoller {
    pub fn new(catalog: &MemoryCatalog, locks: &MemoryLockSpace, delay: Duration) -> Self {
        Self {
            catalog: catalog.clone(),
            locks: locks.clone(),
            delay,
            delays: HashMap::new(),
            failing: HashSet::new(),
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            polled: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, ids: impl IntoIterator<Item = DeviceId>) -> Self {
        self.failing.extend(ids);
        self
    }

    pub fn with_delay(mut self, id: DeviceId, delay: Duration) -> Self {
        self.delays.insert(id, delay);
        self
    }

    /// Devices in the order their polls started
    pub fn polled(&self) -> Vec<DeviceId> {
        self.polled.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// When the first poll of `id` started
    pub fn started_at(&self, id: DeviceId) -> Option<Instant> {
        self.polled
            .lock()
            .unwrap()
            .iter()
            .find(|(polled, _)| *polled == id)
            .map(|(_, at)| *at)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollRunner for SimulatedPoller {
    async fn poll(&self, device_id: DeviceId) -> Result<()> {
        let session = self.locks.session();
        let lock = LockPurpose::Polling.lock_name(device_id);

        if !session.try_lock(&lock, Duration::ZERO).await? {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("device {} is already being polled", device_id);
        }
        if !self.in_flight.lock().unwrap().insert(device_id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.polled.lock().unwrap().push((device_id, Instant::now()));

        let delay = self.delays.get(&device_id).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        let result = if self.failing.contains(&device_id) {
            Err(anyhow::anyhow!("device {} did not answer", device_id))
        } else {
            self.catalog.mark_polled(device_id, Utc::now()).await;
            Ok(())
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.lock().unwrap().remove(&device_id);
        session.release(&lock).await?;

        result
    }
}
