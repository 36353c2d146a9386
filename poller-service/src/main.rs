//! Poller service
//!
//! Polls every device of the fleet through the external poller program,
//! most stale device first, with a bounded pool of workers. Any number of
//! instances may run against the same database: named database locks make
//! sure a device is never polled by two of them at once.
//!
//! Architecture:
//! - Configuration: command line plus the installation's config dump
//! - Repositories: device catalog, run summaries and named locks (poller-store)
//! - Services: lock coordination, poll execution, aggregation, reporting
//! - Scheduler: admission loop feeding the worker pool
//!
//! Exits with 0 when the run kept within its frequency, 2 when it was
//! degraded or could not run at all.

mod cli;
mod config;
mod run;
mod scheduler;
mod service;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use poller_core::domain::run::RunVerdict;
use poller_store::db;
use poller_store::repository::{MySqlDeviceRepository, MySqlLockRepository, MySqlPollerRepository};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::cli::Cli;
use crate::config::{Config, InstallConfig};
use crate::run::{PollerDeps, run_poller};
use crate::service::CommandPollRunner;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "poller_service=info,poller_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let run_id = Uuid::new_v4();

    match run(cli).instrument(info_span!("run", %run_id)).await {
        Ok(verdict) => ExitCode::from(verdict.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(RunVerdict::Degraded.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<RunVerdict> {
    let (config, install) = load_config(&cli).await?;
    info!(
        "Loaded configuration: poller_name={}, workers={}, frequency={}s",
        config.poller_name,
        config.workers,
        config.frequency.as_secs()
    );

    let db_settings = install.db_settings()?;

    info!("Connecting to database...");
    let pool = db::create_pool(&db_settings)
        .await
        .context("Could not connect to MySQL database")?;
    let lock_connection = db::open_lock_connection(&db_settings)
        .await
        .context("Could not open lock session on MySQL database")?;
    info!("Database connections established");

    let deps = PollerDeps {
        devices: Arc::new(MySqlDeviceRepository::new(pool.clone())),
        pollers: Arc::new(MySqlPollerRepository::new(pool.clone())),
        locks: Arc::new(MySqlLockRepository::new(lock_connection)),
        runner: Arc::new(CommandPollRunner::new(
            config.php.clone(),
            config.poller_path.clone(),
            config.poll_timeout,
        )),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let report = run_poller(&config, deps, shutdown).await;
    pool.close().await;

    let report = report?;
    info!(
        "Run finished: {} polled, {} failed, {} seconds",
        report.stats.devices_polled,
        report.stats.devices_failed,
        report.total_time.as_secs()
    );
    Ok(report.verdict)
}

async fn load_config(cli: &Cli) -> Result<(Config, InstallConfig)> {
    let settings = cli.run_settings()?;

    let install_dir = cli.resolve_install_dir()?;
    let install = InstallConfig::load(&install_dir, &cli.php).await?;

    let mut config = Config::from_install(&install, settings)?;
    config.php = cli.php.clone();
    config.sweep = cli.once;
    config.poll_timeout = cli.poll_timeout.map(Duration::from_secs);
    if let Some(grace) = cli.shutdown_grace {
        config.shutdown_grace = Duration::from_secs(grace);
    }

    config.validate()?;
    Ok((config, install))
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, stopping"),
        () = terminate => info!("Received SIGTERM, stopping"),
        () = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
