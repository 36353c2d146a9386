//! Poll scheduler
//!
//! Feeds the worker pool with devices, most stale first. Every pass reads
//! the catalog again, so `last_polled` updates made by peers and by our own
//! finished polls are always taken into account.
//!
//! A candidate is dispatched only after its `queued` reservation was taken
//! while both of its locks were observed free. The reservation travels with
//! the poll and is released by the worker that ran it. A device that is not
//! due yet is parked: the scheduler reserves it, waits until it becomes due
//! and dispatches it then.

use anyhow::{Context, Result};
use chrono::Utc;
use poller_core::domain::device::{Device, DeviceId, PollerGroup};
use poller_core::domain::lock::LockPurpose;
use poller_store::repository::DeviceRepository;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::service::{LockCoordinator, WorkerPool};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub frequency: Duration,
    pub group: Option<PollerGroup>,

    /// Stop at the first candidate that is not due yet
    pub sweep: bool,

    pub admission_interval: Duration,
    pub idle_interval: Duration,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            frequency: config.frequency,
            group: config.poller_group.clone(),
            sweep: config.sweep,
            admission_interval: config.admission_interval,
            idle_interval: config.idle_interval,
        }
    }
}

/// What a single pass over the candidates achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Dispatched,
    NothingDue,
    SweepComplete,
    Stopped,
}

pub struct PollScheduler {
    settings: SchedulerSettings,
    devices: Arc<dyn DeviceRepository>,
    locks: Arc<LockCoordinator>,

    /// Devices this instance dispatched within the last `frequency`
    ///
    /// A failed poll leaves `last_polled` untouched, so without this the
    /// device would be picked again right away.
    recently_dispatched: HashMap<DeviceId, Instant>,
}

impl PollScheduler {
    pub fn new(
        settings: SchedulerSettings,
        devices: Arc<dyn DeviceRepository>,
        locks: Arc<LockCoordinator>,
    ) -> Self {
        Self {
            settings,
            devices,
            locks,
            recently_dispatched: HashMap::new(),
        }
    }

    /// Runs the admission loop until a stop is requested, the sweep is
    /// complete or the lock backend fails
    ///
    /// In-flight polls are left to the caller, which drains the pool.
    pub async fn run(&mut self, pool: &mut WorkerPool, shutdown: &CancellationToken) -> Result<()> {
        info!(
            "Starting scheduler loop (workers: {}, frequency: {}s{})",
            pool.capacity(),
            self.settings.frequency.as_secs(),
            match &self.settings.group {
                Some(group) => format!(", groups: {}", group),
                None => String::new(),
            }
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Stop requested, no longer admitting devices");
                return Ok(());
            }

            if pool.is_saturated() {
                debug!("All {} workers busy", pool.active());
                idle(self.settings.admission_interval, shutdown).await;
                continue;
            }

            match self.run_pass(pool, shutdown).await? {
                Pass::Dispatched | Pass::Stopped => {}
                Pass::NothingDue => idle(self.settings.idle_interval, shutdown).await,
                Pass::SweepComplete => {
                    info!(
                        "Sweep complete after dispatching {} device(s)",
                        pool.dispatched()
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Walks the candidates in staleness order and dispatches the first one
    /// that can be reserved
    async fn run_pass(&mut self, pool: &mut WorkerPool, shutdown: &CancellationToken) -> Result<Pass> {
        let candidates = self
            .devices
            .list_pollable(self.settings.group.as_ref())
            .await
            .context("Failed to query pollable devices")?;

        self.forget_expired();
        let now = Utc::now();

        for device in candidates {
            if !self.is_eligible(&device).await? {
                continue;
            }

            if device.is_due(now, self.settings.frequency) {
                if !self.locks.try_acquire(LockPurpose::Queued, device.id).await? {
                    continue;
                }
                self.dispatch(pool, device.id).await?;
                return Ok(Pass::Dispatched);
            }

            // Candidates are ordered by staleness: nothing after this one is
            // due either.
            if self.settings.sweep {
                return Ok(Pass::SweepComplete);
            }

            if !self.locks.try_acquire(LockPurpose::Queued, device.id).await? {
                continue;
            }

            let wait = device.time_until_due(Utc::now(), self.settings.frequency);
            info!(
                "Device {} is due in {} seconds, waiting for it",
                device.id,
                wait.as_secs()
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.locks.release(LockPurpose::Queued, device.id).await?;
                    return Ok(Pass::Stopped);
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // The device may have been picked up by a poll started elsewhere
            // while we waited.
            if !self.locks.is_free(LockPurpose::Polling, device.id).await? {
                info!("Device {} got polled while waiting, giving it up", device.id);
                self.locks.release(LockPurpose::Queued, device.id).await?;
                return Ok(Pass::NothingDue);
            }

            self.dispatch(pool, device.id).await?;
            return Ok(Pass::Dispatched);
        }

        if self.settings.sweep {
            Ok(Pass::SweepComplete)
        } else {
            debug!("No device can be dispatched right now");
            Ok(Pass::NothingDue)
        }
    }

    /// Whether the device may be reserved by this instance
    ///
    /// Lock checks are in-band: a backend error aborts the pass.
    async fn is_eligible(&self, device: &Device) -> Result<bool> {
        if device.disabled {
            return Ok(false);
        }

        if self.recently_dispatched.contains_key(&device.id) {
            return Ok(false);
        }

        if !self.locks.is_free(LockPurpose::Polling, device.id).await? {
            debug!("Device {} is being polled, skipping", device.id);
            return Ok(false);
        }

        if !self.locks.is_free(LockPurpose::Queued, device.id).await? {
            debug!("Device {} is already queued, skipping", device.id);
            return Ok(false);
        }

        Ok(true)
    }

    /// Hands a reserved device to the pool
    ///
    /// On failure the reservation is given back before the error surfaces.
    async fn dispatch(&mut self, pool: &mut WorkerPool, device_id: DeviceId) -> Result<()> {
        match pool.dispatch(device_id).await {
            Ok(task) => {
                debug!("Device {} handed to {}", device_id, task.worker_id);
                self.recently_dispatched.insert(device_id, Instant::now());
                Ok(())
            }
            Err(e) => {
                self.locks.release(LockPurpose::Queued, device_id).await?;
                Err(e)
            }
        }
    }

    fn forget_expired(&mut self) {
        let frequency = self.settings.frequency;
        self.recently_dispatched
            .retain(|_, dispatched_at| dispatched_at.elapsed() < frequency);
    }
}

/// Sleeps for `duration` or until a stop is requested
async fn idle(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
