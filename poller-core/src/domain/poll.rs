//! Poll domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::device::DeviceId;

/// A single poll handed to a worker
///
/// Lives for the duration of one poll and is consumed when the
/// corresponding [`PollOutcome`] is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollTask {
    pub device_id: DeviceId,
    pub worker_id: String,
    pub dispatched_at: DateTime<Utc>,
}

impl PollTask {
    pub fn new(device_id: DeviceId, worker_id: String) -> Self {
        Self {
            device_id,
            worker_id,
            dispatched_at: Utc::now(),
        }
    }

    /// Turns the task into its outcome
    pub fn finish(self, status: PollStatus, elapsed: Duration) -> PollOutcome {
        PollOutcome {
            device_id: self.device_id,
            worker_id: self.worker_id,
            elapsed,
            status,
        }
    }
}

/// How a poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollStatus::Completed => write!(f, "completed"),
            PollStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one poll, produced exactly once per [`PollTask`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub device_id: DeviceId,
    pub worker_id: String,
    pub elapsed: Duration,
    pub status: PollStatus,
}

impl PollOutcome {
    pub fn completed(device_id: DeviceId, worker_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            device_id,
            worker_id: worker_id.into(),
            elapsed,
            status: PollStatus::Completed,
        }
    }

    pub fn failed(device_id: DeviceId, worker_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            device_id,
            worker_id: worker_id.into(),
            elapsed,
            status: PollStatus::Failed,
        }
    }

    /// Elapsed wall-clock time truncated to whole seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed.as_secs()
    }

    pub fn is_success(&self) -> bool {
        self.status == PollStatus::Completed
    }

    /// Whether this poll alone used up the frequency budget
    pub fn is_slow(&self, frequency: Duration) -> bool {
        self.elapsed >= frequency
    }
}
