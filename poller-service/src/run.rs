//! One run of the poller service
//!
//! Wires the scheduler, the worker pool and the result aggregator together,
//! then reports the run once every poll has been accounted for.

use anyhow::{Context, Result};
use chrono::Local;
use poller_core::domain::run::{RunStats, RunVerdict};
use poller_store::repository::{DeviceRepository, LockRepository, PollerRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::scheduler::{PollScheduler, SchedulerSettings};
use crate::service::{LockCoordinator, PollRunner, ResultAggregator, RunReporter, WorkerPool};

/// Backends a run talks to
pub struct PollerDeps {
    pub devices: Arc<dyn DeviceRepository>,
    pub pollers: Arc<dyn PollerRepository>,

    /// Must be a session of its own, separate from the pooled connections
    pub locks: Arc<dyn LockRepository>,

    pub runner: Arc<dyn PollRunner>,
}

#[derive(Debug)]
pub struct RunReport {
    pub verdict: RunVerdict,
    pub stats: RunStats,
    pub total_time: Duration,
}

/// Runs the scheduler until it stops, drains the pool and reports
///
/// The summary is persisted even when the scheduler stopped on an error;
/// that error is returned afterwards.
pub async fn run_poller(
    config: &Config,
    deps: PollerDeps,
    shutdown: CancellationToken,
) -> Result<RunReport> {
    let started = Instant::now();
    info!(
        "Starting the poller at {} with {} workers",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        config.workers
    );

    let locks = Arc::new(LockCoordinator::new(deps.locks));
    let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
    let aggregator = tokio::spawn(ResultAggregator::new(config.frequency).run(outcomes_rx));

    let mut pool = WorkerPool::new(config.workers, deps.runner, Arc::clone(&locks), outcomes_tx);
    let mut scheduler = PollScheduler::new(
        SchedulerSettings::from(config),
        deps.devices,
        Arc::clone(&locks),
    );

    let scheduled = scheduler.run(&mut pool, &shutdown).await;
    if let Err(e) = &scheduled {
        error!("Scheduler stopped: {:#}", e);
    }

    // A finished sweep waits for every poll so slow devices are reported;
    // the grace only bounds draining after a stop request or a failure.
    let grace =
        (shutdown.is_cancelled() || scheduled.is_err()).then_some(config.shutdown_grace);
    let abandoned = pool.shutdown(grace).await;
    if abandoned > 0 {
        warn!("{} poll(s) did not finish and are not counted", abandoned);
    }

    let leftover = locks.held_count().await;
    if leftover > 0 {
        match locks.release_all().await {
            Ok(released) => debug!("Released {} of {} leftover lock(s)", released, leftover),
            Err(e) => warn!("Could not release leftover locks: {}", e),
        }
    }

    let stats = aggregator.await.context("Result aggregator failed")?;
    let total_time = started.elapsed();

    let reporter = RunReporter::new(
        config.poller_name.clone(),
        config.workers,
        config.frequency,
        deps.pollers,
    );
    let reported = reporter.report(&stats, total_time).await;

    if let Err(e) = scheduled {
        if let Err(report_error) = &reported {
            error!("{:#}", report_error);
        }
        return Err(e);
    }

    Ok(RunReport {
        verdict: reported?,
        stats,
        total_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::RunSettings;
    use crate::testing::{SimulatedPoller, aged};
    use poller_core::domain::run::{DegradationReport, Recommendation};
    use poller_store::repository::{MemoryCatalog, MemoryLockSpace};

    fn config(name: &str, workers: usize, sweep: bool) -> Config {
        let mut config = Config::new(
            name,
            RunSettings {
                workers,
                frequency: Duration::from_secs(300),
            },
        );
        config.sweep = sweep;
        config
    }

    fn deps(
        catalog: &MemoryCatalog,
        space: &MemoryLockSpace,
        poller: &Arc<SimulatedPoller>,
    ) -> PollerDeps {
        PollerDeps {
            devices: Arc::new(catalog.clone()),
            pollers: Arc::new(catalog.clone()),
            locks: Arc::new(space.session()),
            runner: poller.clone(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_failures_and_persists_summary() {
        let catalog = MemoryCatalog::with_devices((1..=5).map(|id| aged(id, 600)));
        let space = MemoryLockSpace::new();
        let poller = Arc::new(
            SimulatedPoller::new(&catalog, &space, Duration::from_secs(2)).failing([3]),
        );

        let report = run_poller(
            &config("poller-a", 4, true),
            deps(&catalog, &space, &poller),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.verdict, RunVerdict::WithinBudget);
        assert_eq!(report.stats.devices_polled, 5);
        assert_eq!(report.stats.devices_failed, 1);

        let summaries = catalog.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].poller_name, "poller-a");
        assert_eq!(summaries[0].devices_polled, 5);
        assert_eq!(space.held_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_instances_never_poll_the_same_device() {
        let catalog = MemoryCatalog::with_devices((1..=20).map(|id| aged(id, 400 + id as i64)));
        let space = MemoryLockSpace::new();
        let poller = Arc::new(SimulatedPoller::new(&catalog, &space, Duration::from_secs(3)));

        let config_a = config("poller-a", 3, true);
        let config_b = config("poller-b", 3, true);
        let (a, b) = tokio::join!(
            run_poller(&config_a, deps(&catalog, &space, &poller), CancellationToken::new()),
            run_poller(&config_b, deps(&catalog, &space, &poller), CancellationToken::new()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(poller.overlaps(), 0);
        let mut polled = poller.polled();
        assert_eq!(
            a.stats.devices_polled + b.stats.devices_polled,
            polled.len() as u64
        );
        polled.sort();
        polled.dedup();
        assert_eq!(polled, (1..=20).collect::<Vec<_>>());
        assert_eq!(catalog.summaries().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_device_degrades_the_run() {
        let catalog = MemoryCatalog::with_devices([aged(1, 900), aged(2, 800)]);
        let space = MemoryLockSpace::new();
        let poller = Arc::new(
            SimulatedPoller::new(&catalog, &space, Duration::from_secs(5))
                .with_delay(1, Duration::from_secs(310)),
        );

        // Default grace, shorter than the slow poll
        let config = config("poller-a", 2, true);
        assert_eq!(config.shutdown_grace, Duration::from_secs(300));

        let report = run_poller(&config, deps(&catalog, &space, &poller), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.verdict, RunVerdict::Degraded);
        assert_eq!(report.verdict.exit_code(), 2);
        assert_eq!(report.stats.devices_polled, 2);
        assert!(report.total_time >= Duration::from_secs(310));
        assert_eq!(report.stats.per_device_elapsed[&1].as_secs(), 310);

        let degradation = DegradationReport::analyze(
            &report.stats,
            report.total_time,
            config.frequency,
            config.workers,
        )
        .unwrap();
        assert_eq!(degradation.slow_devices.len(), 1);
        assert_eq!(degradation.recommendation, Recommendation::NoSafeRecommendation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_drains_and_reports() {
        let catalog = MemoryCatalog::with_devices((1..=4).map(|id| aged(id, 600)));
        let space = MemoryLockSpace::new();
        let poller = Arc::new(
            SimulatedPoller::new(&catalog, &space, Duration::from_secs(20))
                .with_delay(4, Duration::from_secs(1000)),
        );

        let mut config = config("poller-a", 4, false);
        config.shutdown_grace = Duration::from_secs(60);

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stopper.cancel();
        });

        let report = run_poller(&config, deps(&catalog, &space, &poller), shutdown)
            .await
            .unwrap();

        // Device 4 outlives the grace period and is not counted
        assert_eq!(report.stats.devices_polled, 3);
        assert_eq!(catalog.summaries().await[0].devices_polled, 3);
        assert!(report.total_time < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_loss_still_persists_summary() {
        let catalog = MemoryCatalog::with_devices([aged(1, 600)]);
        let space = MemoryLockSpace::new();
        let poller = Arc::new(SimulatedPoller::new(&catalog, &space, Duration::from_secs(1)));

        let session = space.session();
        session.sever();
        let mut deps = deps(&catalog, &space, &poller);
        deps.locks = Arc::new(session);

        let result = run_poller(&config("poller-a", 2, false), deps, CancellationToken::new()).await;

        assert!(result.is_err());
        assert!(poller.polled().is_empty());
        assert_eq!(catalog.summaries().await[0].devices_polled, 0);
    }
}
