//! Run statistics and degradation analysis

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::device::DeviceId;
use crate::domain::poll::{PollOutcome, PollStatus};

/// Statistics accumulated over one scheduler run
///
/// Updates are commutative, so outcomes may be recorded in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Number of outcomes recorded, failed polls included
    pub devices_polled: u64,

    pub devices_failed: u64,

    /// Elapsed time of the most recent poll of each device
    pub per_device_elapsed: HashMap<DeviceId, Duration>,

    /// Sum of all poll durations, i.e. the fully sequential run time
    pub cumulative_elapsed: Duration,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: &PollOutcome) {
        self.devices_polled += 1;
        if outcome.status == PollStatus::Failed {
            self.devices_failed += 1;
        }
        self.per_device_elapsed
            .insert(outcome.device_id, outcome.elapsed);
        self.cumulative_elapsed += outcome.elapsed;
    }
}

/// Persisted record of a run, one row per poller name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub poller_name: String,
    pub polled_at: DateTime<Utc>,
    pub devices_polled: u64,

    /// Whole-run wall clock time in seconds
    pub time_taken: u64,
}

impl RunSummary {
    pub fn new(poller_name: impl Into<String>, devices_polled: u64, time_taken: Duration) -> Self {
        Self {
            poller_name: poller_name.into(),
            polled_at: Utc::now(),
            devices_polled,
            time_taken: time_taken.as_secs(),
        }
    }
}

/// Worker count advice given when a run overruns its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    /// Run with at least this many workers
    Workers(u64),

    /// Some device alone takes longer than the frequency; more workers
    /// cannot fix that
    NoSafeRecommendation,
}

/// Diagnostics for a run whose total time exceeded the frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationReport {
    pub total_time: Duration,
    pub frequency: Duration,
    pub workers: usize,

    /// What the run would have taken polling one device at a time
    pub sequential_elapsed: Duration,

    /// Devices whose single poll exceeded the frequency, sorted by id
    pub slow_devices: Vec<(DeviceId, Duration)>,

    pub recommendation: Recommendation,
}

impl DegradationReport {
    /// Analyses a finished run; `None` when it stayed within budget
    ///
    /// Times are compared in whole seconds.
    pub fn analyze(
        stats: &RunStats,
        total_time: Duration,
        frequency: Duration,
        workers: usize,
    ) -> Option<Self> {
        if total_time.as_secs() <= frequency.as_secs() {
            return None;
        }

        let mut slow_devices: Vec<(DeviceId, Duration)> = stats
            .per_device_elapsed
            .iter()
            .filter(|(_, elapsed)| elapsed.as_secs() > frequency.as_secs())
            .map(|(id, elapsed)| (*id, *elapsed))
            .collect();
        slow_devices.sort_by_key(|(id, _)| *id);

        let recommendation = if slow_devices.is_empty() {
            Recommendation::Workers(recommend_workers(
                total_time.as_secs(),
                frequency.as_secs(),
                workers,
            ))
        } else {
            Recommendation::NoSafeRecommendation
        };

        Some(Self {
            total_time,
            frequency,
            workers,
            sequential_elapsed: stats.cumulative_elapsed,
            slow_devices,
            recommendation,
        })
    }

    pub fn has_show_stopper(&self) -> bool {
        !self.slow_devices.is_empty()
    }
}

/// Minimum worker count that would have fit the run into the frequency
///
/// `floor(total / frequency * workers + 1)`; 600 s at 300 s with 16 workers
/// gives 33.
pub fn recommend_workers(total_secs: u64, frequency_secs: u64, workers: usize) -> u64 {
    let frequency_secs = frequency_secs.max(1) as f64;
    (total_secs as f64 / frequency_secs * workers as f64 + 1.0) as u64
}

/// Overall judgement of a run, mapped to the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunVerdict {
    WithinBudget,
    Degraded,
}

impl RunVerdict {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunVerdict::WithinBudget => 0,
            RunVerdict::Degraded => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQUENCY: Duration = Duration::from_secs(300);

    fn stats_from(outcomes: &[PollOutcome]) -> RunStats {
        let mut stats = RunStats::new();
        for outcome in outcomes {
            stats.record(outcome);
        }
        stats
    }

    #[test]
    fn test_record_outcomes() {
        let stats = stats_from(&[
            PollOutcome::completed(1, "worker-1", Duration::from_secs(10)),
            PollOutcome::failed(2, "worker-2", Duration::from_secs(5)),
            PollOutcome::completed(1, "worker-3", Duration::from_secs(12)),
        ]);

        assert_eq!(stats.devices_polled, 3);
        assert_eq!(stats.devices_failed, 1);
        assert_eq!(stats.per_device_elapsed.len(), 2);
        assert_eq!(stats.per_device_elapsed[&1], Duration::from_secs(12));
        assert_eq!(stats.cumulative_elapsed, Duration::from_secs(27));
    }

    #[test]
    fn test_recommendation_formula() {
        assert_eq!(recommend_workers(600, 300, 16), 33);
        assert_eq!(recommend_workers(301, 300, 16), 17);
        assert_eq!(recommend_workers(450, 300, 4), 7);
    }

    #[test]
    fn test_within_budget_has_no_report() {
        let stats = stats_from(&[PollOutcome::completed(1, "w", Duration::from_secs(20))]);

        assert!(DegradationReport::analyze(&stats, Duration::from_secs(300), FREQUENCY, 16).is_none());
        assert!(DegradationReport::analyze(&stats, Duration::from_millis(300_900), FREQUENCY, 16).is_none());
    }

    #[test]
    fn test_overrun_recommends_workers() {
        let stats = stats_from(&[
            PollOutcome::completed(1, "w", Duration::from_secs(200)),
            PollOutcome::completed(2, "w", Duration::from_secs(250)),
        ]);

        let report =
            DegradationReport::analyze(&stats, Duration::from_secs(600), FREQUENCY, 16).unwrap();

        assert_eq!(report.sequential_elapsed, Duration::from_secs(450));
        assert!(!report.has_show_stopper());
        assert_eq!(report.recommendation, Recommendation::Workers(33));
    }

    #[test]
    fn test_slow_device_is_show_stopper() {
        let stats = stats_from(&[
            PollOutcome::completed(4, "w", Duration::from_secs(310)),
            PollOutcome::completed(5, "w", Duration::from_secs(30)),
        ]);

        let report =
            DegradationReport::analyze(&stats, Duration::from_secs(320), FREQUENCY, 16).unwrap();

        assert_eq!(report.slow_devices, vec![(4, Duration::from_secs(310))]);
        assert_eq!(report.recommendation, Recommendation::NoSafeRecommendation);
    }

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(RunVerdict::WithinBudget.exit_code(), 0);
        assert_eq!(RunVerdict::Degraded.exit_code(), 2);
    }
}
