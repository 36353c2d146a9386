//! Worker pool executor
//!
//! Runs device polls with bounded parallelism. Each dispatched device gets
//! its own task which invokes the external poller, times it and emits
//! exactly one [`PollOutcome`] to the aggregator channel. A failing poll is
//! recorded as failed and never affects the other workers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use poller_core::domain::device::DeviceId;
use poller_core::domain::lock::LockPurpose;
use poller_core::domain::poll::{PollOutcome, PollStatus, PollTask};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::service::lock_coordinator::LockCoordinator;

/// Polls a single device
///
/// Implementations are expected to advance the device's `last_polled` in
/// the catalog when the poll succeeds.
#[async_trait]
pub trait PollRunner: Send + Sync {
    async fn poll(&self, device_id: DeviceId) -> Result<()>;
}

/// Runs the external poller program once per device
///
/// `/usr/bin/env <php> <poller_path> -h <device_id>`, stdin closed and
/// output discarded. The child is killed if the poll is abandoned.
pub struct CommandPollRunner {
    php: String,
    poller_path: PathBuf,
    timeout: Option<Duration>,
}

impl CommandPollRunner {
    pub fn new(php: impl Into<String>, poller_path: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            php: php.into(),
            poller_path,
            timeout,
        }
    }
}

#[async_trait]
impl PollRunner for CommandPollRunner {
    async fn poll(&self, device_id: DeviceId) -> Result<()> {
        let mut command = Command::new("/usr/bin/env");
        command
            .arg(&self.php)
            .arg(&self.poller_path)
            .arg("-h")
            .arg(device_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, command.status())
                .await
                .map_err(|_| anyhow::anyhow!("Poll timed out after {:?}", timeout))?,
            None => command.status().await,
        }
        .context("Failed to run poller")?;

        if !status.success() {
            anyhow::bail!("Poller exited with {}", status);
        }

        Ok(())
    }
}

/// Bounded pool of poll workers
///
/// The semaphore caps concurrently running polls at `capacity`; a dispatch
/// waits for a free slot when the pool is full. Each task owns the `queued`
/// reservation of its device and releases it once the poll is over.
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    runner: Arc<dyn PollRunner>,
    locks: Arc<LockCoordinator>,
    outcomes: Option<mpsc::UnboundedSender<PollOutcome>>,
    tasks: JoinSet<()>,
    dispatched: u64,
}

impl WorkerPool {
    pub fn new(
        capacity: usize,
        runner: Arc<dyn PollRunner>,
        locks: Arc<LockCoordinator>,
        outcomes: mpsc::UnboundedSender<PollOutcome>,
    ) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            runner,
            locks,
            outcomes: Some(outcomes),
            tasks: JoinSet::new(),
            dispatched: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of polls currently running
    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn is_saturated(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Total number of polls dispatched so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Starts polling a device whose `queued` lock the caller holds
    ///
    /// Waits for a free worker slot if the pool is full.
    pub async fn dispatch(&mut self, device_id: DeviceId) -> Result<PollTask> {
        self.reap_finished();

        let outcomes = self
            .outcomes
            .clone()
            .context("Worker pool is shutting down")?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("Worker pool is closed")?;

        self.dispatched += 1;
        let task = PollTask::new(device_id, format!("worker-{}", self.dispatched));
        debug!("Dispatching device {} to {}", device_id, task.worker_id);

        let runner = Arc::clone(&self.runner);
        let locks = Arc::clone(&self.locks);
        let spawned = task.clone();

        self.tasks.spawn(async move {
            run_task(spawned, runner, locks, outcomes, permit).await;
        });

        Ok(task)
    }

    /// Stops accepting work and waits for running polls
    ///
    /// With a `grace`, polls still running after it are aborted; they emit
    /// no outcome. Without one every poll is awaited. Returns how many polls
    /// were abandoned.
    pub async fn shutdown(mut self, grace: Option<Duration>) -> usize {
        self.outcomes.take();
        self.permits.close();

        let running = self.tasks.len();
        let Some(grace) = grace else {
            if running > 0 {
                info!("Waiting for {} running poll(s) to finish", running);
            }
            drain(&mut self.tasks).await;
            return 0;
        };

        if running > 0 {
            info!("Waiting up to {:?} for {} running poll(s)", grace, running);
        }

        if tokio::time::timeout(grace, drain(&mut self.tasks))
            .await
            .is_ok()
        {
            return 0;
        }

        let abandoned = self.tasks.len();
        warn!("Abandoning {} poll(s) still running after {:?}", abandoned, grace);
        self.tasks.abort_all();
        drain(&mut self.tasks).await;

        abandoned
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!("Poll task panicked: {}", e);
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Poll task panicked: {}", e);
            }
        }
    }
}

async fn run_task(
    task: PollTask,
    runner: Arc<dyn PollRunner>,
    locks: Arc<LockCoordinator>,
    outcomes: mpsc::UnboundedSender<PollOutcome>,
    _permit: OwnedSemaphorePermit,
) {
    let device_id = task.device_id;
    let outcome = execute_poll(task, runner.as_ref()).await;

    if let Err(e) = locks.release(LockPurpose::Queued, device_id).await {
        error!("Failed to release queue reservation of device {}: {}", device_id, e);
    }

    if outcomes.send(outcome).is_err() {
        warn!("Outcome of device {} dropped, aggregator is gone", device_id);
    }
}

/// Runs one poll and turns whatever happened into an outcome
pub async fn execute_poll(task: PollTask, runner: &dyn PollRunner) -> PollOutcome {
    let started = Instant::now();
    let result = runner.poll(task.device_id).await;
    let elapsed = started.elapsed();

    match result {
        Ok(()) => task.finish(PollStatus::Completed, elapsed),
        Err(e) => {
            debug!("Poll of device {} failed: {:#}", task.device_id, e);
            task.finish(PollStatus::Failed, elapsed)
        }
    }
}
