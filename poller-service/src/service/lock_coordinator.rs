//! Lock coordinator
//!
//! Fleet-wide mutual exclusion per device, on top of the named locks of the
//! shared store. Locks are keyed by `(purpose, device id)`.
//!
//! Any backend error is returned to the caller unchanged: without the lock
//! backend exclusivity cannot be guaranteed, so the scheduler treats these
//! errors as fatal.

use poller_core::domain::device::DeviceId;
use poller_core::domain::lock::LockPurpose;
use poller_store::Result;
use poller_store::repository::LockRepository;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct LockCoordinator {
    backend: Arc<dyn LockRepository>,

    /// Names of the locks this instance currently holds
    held: Mutex<HashSet<String>>,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockRepository>) -> Self {
        Self {
            backend,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Whether no instance, this one included, holds the lock
    pub async fn is_free(&self, purpose: LockPurpose, device_id: DeviceId) -> Result<bool> {
        self.backend.is_free(&purpose.lock_name(device_id)).await
    }

    /// Non-blocking acquisition
    ///
    /// Returns `false` when another instance holds the lock and also when
    /// this instance already does: backend sessions are re-entrant, but a
    /// reservation must never be handed out twice.
    pub async fn try_acquire(&self, purpose: LockPurpose, device_id: DeviceId) -> Result<bool> {
        self.acquire_blocking(purpose, device_id, Duration::ZERO)
            .await
    }

    /// Waits up to `timeout` for the lock
    pub async fn acquire_blocking(
        &self,
        purpose: LockPurpose,
        device_id: DeviceId,
        timeout: Duration,
    ) -> Result<bool> {
        let name = purpose.lock_name(device_id);

        if self.held.lock().await.contains(&name) {
            debug!("Lock {} already held by this instance", name);
            return Ok(false);
        }

        // The held set is not locked while waiting so workers can release
        // their own reservations meanwhile.
        if !self.backend.try_lock(&name, timeout).await? {
            return Ok(false);
        }

        let newly_held = self.held.lock().await.insert(name.clone());
        if newly_held {
            debug!("Acquired lock {}", name);
        }

        Ok(newly_held)
    }

    /// Releases a lock held by this instance
    pub async fn release(&self, purpose: LockPurpose, device_id: DeviceId) -> Result<bool> {
        let name = purpose.lock_name(device_id);
        let mut held = self.held.lock().await;

        let released = self.backend.release(&name).await?;
        held.remove(&name);

        if released {
            debug!("Released lock {}", name);
        } else {
            warn!("Lock {} was not held when released", name);
        }

        Ok(released)
    }

    /// Releases every lock this instance still holds
    ///
    /// Returns how many locks were released.
    pub async fn release_all(&self) -> Result<usize> {
        let mut held = self.held.lock().await;
        let mut released = 0;

        for name in held.drain() {
            if self.backend.release(&name).await? {
                released += 1;
            }
        }

        Ok(released)
    }

    /// Number of locks this instance holds
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}
