//! Named lock domain types
//!
//! Every device is guarded by two advisory locks in the shared store:
//! `polling.<id>` while a poll is running and `queued.<id>` while a
//! scheduler instance holds a reservation to poll it.

use serde::{Deserialize, Serialize};

use crate::domain::device::DeviceId;

/// What a device lock is held for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockPurpose {
    /// A poll of the device is in flight
    Polling,

    /// A scheduler instance has reserved the device for dispatch
    Queued,
}

impl LockPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockPurpose::Polling => "polling",
            LockPurpose::Queued => "queued",
        }
    }

    /// Name of the lock in the shared namespace, e.g. `queued.42`
    pub fn lock_name(&self, device_id: DeviceId) -> String {
        format!("{}.{}", self.as_str(), device_id)
    }
}

impl std::fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
