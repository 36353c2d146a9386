//! Command-line interface
//!
//! `poller-service [worker_count] [frequency_seconds]` plus a few options.
//! The positional numbers are lenient: garbage falls back to the default,
//! an explicit zero is fatal.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_WORKERS: u64 = 16;
pub const DEFAULT_FREQUENCY_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "poller-service")]
#[command(
    about = "Polls every device of the fleet, most stale first, with a bounded worker pool",
    long_about = None,
    allow_negative_numbers = true
)]
pub struct Cli {
    /// Number of devices polled in parallel (default 16)
    #[arg(value_name = "WORKER_COUNT")]
    pub worker_count: Option<String>,

    /// Target interval between two polls of a device, in seconds (default 300)
    #[arg(value_name = "FREQUENCY_SECONDS")]
    pub frequency: Option<String>,

    /// Installation directory holding config.php and poller.php
    #[arg(long, env = "POLLER_INSTALL_DIR")]
    pub install_dir: Option<PathBuf>,

    /// PHP interpreter used for the config dump and the poller
    #[arg(long, env = "POLLER_PHP", default_value = "php")]
    pub php: String,

    /// Poll every device that is currently due, then report and exit
    #[arg(long)]
    pub once: bool,

    /// Kill a device poll after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub poll_timeout: Option<u64>,

    /// How long in-flight polls may finish after a stop request, in seconds
    /// (default: the frequency)
    #[arg(long, value_name = "SECONDS")]
    pub shutdown_grace: Option<u64>,
}

/// Invalid command-line values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("0 is not a valid {0}")]
    Zero(&'static str),
}

/// Numeric run settings taken from the positional arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub workers: usize,
    pub frequency: Duration,
}

impl Cli {
    pub fn run_settings(&self) -> Result<RunSettings, CliError> {
        let workers = positive_or_default(
            self.worker_count.as_deref(),
            DEFAULT_WORKERS,
            "worker count",
        )?;
        let frequency = positive_or_default(
            self.frequency.as_deref(),
            DEFAULT_FREQUENCY_SECS,
            "frequency",
        )?;

        Ok(RunSettings {
            workers: usize::try_from(workers).unwrap_or(usize::MAX),
            frequency: Duration::from_secs(frequency),
        })
    }

    /// Directory of the installation, defaulting to the one holding the binary
    pub fn resolve_install_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.install_dir {
            return Ok(dir.clone());
        }

        let exe = std::env::current_exe()?;
        let exe = exe.canonicalize().unwrap_or(exe);
        exe.parent()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("Cannot determine installation directory"))
    }
}

/// Parses a positive number, falling back to `default` when absent or
/// unparsable
///
/// An explicit zero is an error rather than a fallback.
pub fn positive_or_default(
    raw: Option<&str>,
    default: u64,
    what: &'static str,
) -> Result<u64, CliError> {
    let Some(raw) = raw else {
        return Ok(default);
    };

    match raw.trim().parse::<u64>() {
        Ok(0) => Err(CliError::Zero(what)),
        Ok(value) => Ok(value),
        Err(_) => {
            warn!("Ignoring invalid {} '{}', using {}", what, raw, default);
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["poller-service"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&[]).run_settings().unwrap();
        assert_eq!(settings.workers, 16);
        assert_eq!(settings.frequency, Duration::from_secs(300));
    }

    #[test]
    fn test_explicit_values() {
        let settings = parse(&["32", "60"]).run_settings().unwrap();
        assert_eq!(settings.workers, 32);
        assert_eq!(settings.frequency, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_workers_is_fatal() {
        assert_eq!(
            parse(&["0"]).run_settings(),
            Err(CliError::Zero("worker count"))
        );
    }

    #[test]
    fn test_zero_frequency_is_fatal() {
        assert_eq!(
            parse(&["8", "0"]).run_settings(),
            Err(CliError::Zero("frequency"))
        );
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let settings = parse(&["abc", "soon"]).run_settings().unwrap();
        assert_eq!(settings.workers, 16);
        assert_eq!(settings.frequency, Duration::from_secs(300));
    }

    #[test]
    fn test_negative_numbers_fall_back_to_defaults() {
        let settings = parse(&["-5", "-60"]).run_settings().unwrap();
        assert_eq!(settings.workers, 16);
        assert_eq!(settings.frequency, Duration::from_secs(300));
    }

    #[test]
    fn test_options() {
        let cli = parse(&[
            "4",
            "--once",
            "--poll-timeout",
            "120",
            "--install-dir",
            "/opt/librenms",
        ]);

        assert!(cli.once);
        assert_eq!(cli.poll_timeout, Some(120));
        assert_eq!(
            cli.resolve_install_dir().unwrap(),
            PathBuf::from("/opt/librenms")
        );
        assert_eq!(cli.run_settings().unwrap().workers, 4);
    }
}
