//! Database connection setup

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::ConnectOptions;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Where the catalog database listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbHost {
    /// `unix:/path/to/mysqld.sock`
    Socket(PathBuf),

    /// `host` or `host:port`
    Tcp { host: String, port: Option<u16> },
}

impl DbHost {
    /// Parses the configured host string
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StoreError::InvalidHost(raw.to_string()));
        }

        if raw
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("unix:"))
        {
            let path = &raw[5..];
            if path.is_empty() {
                return Err(StoreError::InvalidHost(raw.to_string()));
            }
            return Ok(DbHost::Socket(PathBuf::from(path)));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| StoreError::InvalidHost(raw.to_string()))?;
                Ok(DbHost::Tcp {
                    host: host.to_string(),
                    port: Some(port),
                })
            }
            None => Ok(DbHost::Tcp {
                host: raw.to_string(),
                port: None,
            }),
        }
    }
}

/// Credentials and location of the catalog database
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: DbHost,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DbSettings {
    pub fn connect_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .username(&self.username)
            .password(&self.password)
            .database(&self.database);

        match &self.host {
            DbHost::Socket(path) => options.socket(path),
            DbHost::Tcp { host, port } => {
                let options = options.host(host);
                match port {
                    Some(port) => options.port(*port),
                    None => options,
                }
            }
        }
    }
}

/// Pool used for catalog queries and run summaries
pub async fn create_pool(settings: &DbSettings) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(settings.connect_options())
        .await?;

    Ok(pool)
}

/// Dedicated connection for named locks
///
/// MySQL named locks belong to the session that took them, so acquire and
/// release must go through the same connection.
pub async fn open_lock_connection(settings: &DbSettings) -> Result<MySqlConnection> {
    let connection = settings.connect_options().connect().await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        assert_eq!(
            DbHost::parse("db.example.net").unwrap(),
            DbHost::Tcp {
                host: "db.example.net".to_string(),
                port: None
            }
        );
    }

    #[test]
    fn test_parse_host_with_port() {
        assert_eq!(
            DbHost::parse("10.0.0.5:3307").unwrap(),
            DbHost::Tcp {
                host: "10.0.0.5".to_string(),
                port: Some(3307)
            }
        );
    }

    #[test]
    fn test_parse_unix_socket() {
        assert_eq!(
            DbHost::parse("UNIX:/var/run/mysqld/mysqld.sock").unwrap(),
            DbHost::Socket(PathBuf::from("/var/run/mysqld/mysqld.sock"))
        );
    }

    #[test]
    fn test_parse_invalid_hosts() {
        assert!(DbHost::parse("").is_err());
        assert!(DbHost::parse("unix:").is_err());
        assert!(DbHost::parse("localhost:port").is_err());
    }
}
