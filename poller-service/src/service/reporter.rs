//! Run reporter
//!
//! Persists the summary of a finished run and judges whether the configured
//! worker count keeps up with the polling frequency.

use anyhow::{Context, Result};
use poller_core::domain::run::{DegradationReport, Recommendation, RunStats, RunSummary, RunVerdict};
use poller_store::repository::{PollerRepository, UpsertOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct RunReporter {
    poller_name: String,
    workers: usize,
    frequency: Duration,
    repository: Arc<dyn PollerRepository>,
}

impl RunReporter {
    pub fn new(
        poller_name: impl Into<String>,
        workers: usize,
        frequency: Duration,
        repository: Arc<dyn PollerRepository>,
    ) -> Self {
        Self {
            poller_name: poller_name.into(),
            workers,
            frequency,
            repository,
        }
    }

    /// Reports a run whose work is complete and fully aggregated
    pub async fn report(&self, stats: &RunStats, total_time: Duration) -> Result<RunVerdict> {
        info!(
            "poller-service polled {} devices in {} seconds with {} workers",
            stats.devices_polled,
            total_time.as_secs(),
            self.workers
        );
        if stats.devices_failed > 0 {
            warn!("{} poll(s) failed during this run", stats.devices_failed);
        }

        let summary = RunSummary::new(&self.poller_name, stats.devices_polled, total_time);
        match self
            .repository
            .upsert_summary(&summary)
            .await
            .context("Failed to persist run summary")?
        {
            UpsertOutcome::Updated => debug!("Updated summary of poller {}", self.poller_name),
            UpsertOutcome::Inserted => info!("Registered poller {}", self.poller_name),
        }

        match DegradationReport::analyze(stats, total_time, self.frequency, self.workers) {
            Some(report) => {
                log_degradation(&report);
                Ok(RunVerdict::Degraded)
            }
            None => Ok(RunVerdict::WithinBudget),
        }
    }
}

fn log_degradation(report: &DegradationReport) {
    warn!(
        "the process took more than {} seconds to finish, you need faster hardware or more workers",
        report.frequency.as_secs()
    );
    info!(
        "in sequential style polling the elapsed time would have been: {} seconds",
        report.sequential_elapsed.as_secs()
    );

    for (device_id, elapsed) in &report.slow_devices {
        warn!(
            "device {} is taking too long: {} seconds",
            device_id,
            elapsed.as_secs()
        );
    }

    match report.recommendation {
        Recommendation::NoSafeRecommendation => error!(
            "Some devices are taking more than {} seconds, no worker count can be recommended",
            report.frequency.as_secs()
        ),
        Recommendation::Workers(workers) => warn!(
            "Consider setting a minimum of {} workers (currently {})",
            workers, report.workers
        ),
    }
}
