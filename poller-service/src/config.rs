//! Service configuration
//!
//! Two sources feed the configuration:
//! - the installation config, a JSON document printed by
//!   `config_to_json.php` (database credentials, poller identity, group)
//! - the command line (worker count, frequency and run options)

use anyhow::Context;
use poller_core::domain::device::PollerGroup;
use poller_store::db::{DbHost, DbSettings};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::cli::RunSettings;

/// Errors raised while reading the installation config
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} does not seem readable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not execute config dump {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Config dump {command} exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("Could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Installation config as dumped by `config_to_json.php`
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    pub install_dir: PathBuf,
    pub db_host: String,
    pub db_user: String,
    #[serde(default)]
    pub db_pass: String,
    pub db_name: String,

    /// Key of this instance's run summary
    #[serde(default)]
    pub distributed_poller_name: Option<String>,

    /// Restricts polling to these poller groups
    #[serde(default, deserialize_with = "deserialize_group")]
    pub distributed_poller_group: Option<PollerGroup>,
}

impl InstallConfig {
    /// Runs the config dump of the installation in `install_dir` and parses
    /// its output
    pub async fn load(install_dir: &Path, php: &str) -> Result<Self, ConfigError> {
        let config_file = install_dir.join("config.php");
        tokio::fs::File::open(&config_file)
            .await
            .map_err(|source| ConfigError::Unreadable {
                path: config_file.clone(),
                source,
            })?;

        let script = install_dir.join("config_to_json.php");
        let command = format!("/usr/bin/env {} {}", php, script.display());

        let output = Command::new("/usr/bin/env")
            .arg(php)
            .arg(&script)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|source| ConfigError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ConfigError::CommandFailed {
                command,
                status: output.status.to_string(),
            });
        }

        Self::from_json(&output.stdout)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn db_settings(&self) -> anyhow::Result<DbSettings> {
        let host = DbHost::parse(&self.db_host).context("Invalid db_host in configuration")?;

        Ok(DbSettings {
            host,
            username: self.db_user.clone(),
            password: self.db_pass.clone(),
            database: self.db_name.clone(),
        })
    }
}

/// Accepts a group given as a number, a string or a comma separated list
fn deserialize_group<'de, D>(deserializer: D) -> Result<Option<PollerGroup>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => {
            let id = n
                .as_u64()
                .ok_or_else(|| D::Error::custom(format!("invalid poller group {}", n)))?;
            PollerGroup::new(vec![id]).map(Some).map_err(D::Error::custom)
        }
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .parse::<PollerGroup>()
            .map(Some)
            .map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("invalid poller group {}", other))),
    }
}

/// Runtime configuration of one scheduler instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool capacity
    pub workers: usize,

    /// Target interval between two polls of a device
    pub frequency: Duration,

    /// Key of the run summary row
    pub poller_name: String,

    pub poller_group: Option<PollerGroup>,

    /// Poll every due device once, then stop
    pub sweep: bool,

    /// Idle time when the worker pool is saturated
    pub admission_interval: Duration,

    /// Idle time after a pass that dispatched nothing
    pub idle_interval: Duration,

    /// Bound on draining in-flight polls after the loop stopped
    pub shutdown_grace: Duration,

    /// Kill a device poll after this long
    pub poll_timeout: Option<Duration>,

    /// Path of the external poller script
    pub poller_path: PathBuf,

    /// Interpreter running the poller script
    pub php: String,
}

impl Config {
    /// Creates a configuration with defaults for everything but the
    /// numeric run settings
    pub fn new(poller_name: impl Into<String>, settings: RunSettings) -> Self {
        Self {
            workers: settings.workers,
            frequency: settings.frequency,
            poller_name: poller_name.into(),
            poller_group: None,
            sweep: false,
            admission_interval: Duration::from_secs(1),
            idle_interval: Duration::from_secs(1),
            shutdown_grace: settings.frequency,
            poll_timeout: None,
            poller_path: PathBuf::from("poller.php"),
            php: "php".to_string(),
        }
    }

    /// Combines the installation config with the command-line settings
    pub fn from_install(install: &InstallConfig, settings: RunSettings) -> anyhow::Result<Self> {
        let poller_name = match &install.distributed_poller_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => hostname::get()
                .context("distributed_poller_name not set and host name unavailable")?
                .to_string_lossy()
                .into_owned(),
        };

        let mut config = Self::new(poller_name, settings);
        config.poller_group = install.distributed_poller_group.clone();
        config.poller_path = install.install_dir.join("poller.php");
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.frequency.as_secs() == 0 {
            anyhow::bail!("frequency must be at least one second");
        }

        if self.poller_name.trim().is_empty() {
            anyhow::bail!("poller_name cannot be empty");
        }

        if self.admission_interval.is_zero() || self.idle_interval.is_zero() {
            anyhow::bail!("idle intervals must be greater than 0");
        }

        if self.poll_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("poll_timeout must be greater than 0");
        }

        Ok(())
    }
}
