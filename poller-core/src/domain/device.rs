//! Device domain types

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Identifier of a monitored device in the catalog
pub type DeviceId = u64;

/// A monitored device as stored in the shared catalog
///
/// The scheduler only ever reads devices. `last_polled` is advanced by the
/// external poller as a side effect of a successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,

    /// When the device was last polled successfully; `None` if never
    pub last_polled: Option<DateTime<Utc>>,

    /// Poller group the device is assigned to
    pub group: Option<u64>,

    pub disabled: bool,
}

impl Device {
    /// Creates an enabled, ungrouped device
    pub fn new(id: DeviceId, last_polled: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            last_polled,
            group: None,
            disabled: false,
        }
    }

    /// Instant from which the device should be polled again
    pub fn due_at(&self, frequency: Duration) -> Option<DateTime<Utc>> {
        self.last_polled.map(|polled| {
            polled
                .checked_add_signed(to_delta(frequency))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Whether `last_polled` is older than `now - frequency`
    ///
    /// A device that was never polled is always due.
    pub fn is_due(&self, now: DateTime<Utc>, frequency: Duration) -> bool {
        match self.last_polled {
            Some(polled) => now
                .checked_sub_signed(to_delta(frequency))
                .is_some_and(|cutoff| polled < cutoff),
            None => true,
        }
    }

    /// How long to wait from `now` until the device becomes due
    pub fn time_until_due(&self, now: DateTime<Utc>, frequency: Duration) -> Duration {
        self.due_at(frequency)
            .and_then(|due| (due - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Subset of the fleet a scheduler instance is restricted to
///
/// Configured as a single group id or a comma separated list (`"1,3"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerGroup(Vec<u64>);

/// Error returned when a poller group specification cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseGroupError {
    #[error("poller group is empty")]
    Empty,

    #[error("invalid poller group id '{0}'")]
    InvalidId(String),
}

impl PollerGroup {
    /// Creates a group restricted to the given ids
    pub fn new(ids: Vec<u64>) -> Result<Self, ParseGroupError> {
        if ids.is_empty() {
            return Err(ParseGroupError::Empty);
        }
        Ok(Self(ids))
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    /// Whether a device assigned to `group` belongs to this subset
    pub fn contains(&self, group: Option<u64>) -> bool {
        group.is_some_and(|g| self.0.contains(&g))
    }
}

impl FromStr for PollerGroup {
    type Err = ParseGroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| ParseGroupError::InvalidId(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(ids)
    }
}

impl fmt::Display for PollerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", ids.join(","))
    }
}
