//! Service configuration.
//!
//! The daemon loads one [`ServiceConfig`] at startup and passes it down by
//! reference; request-handling code never consults the process environment.
//! (The hook client is the single deliberate exception: it discovers the
//! socket path from the environment variable the DHCP daemon exports to it,
//! because it has no configuration file of its own.)

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffConfig;

/// Longest socket path that fits `sockaddr_un` with its terminator.
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Hook socket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Lease store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, failing closed on unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let socket_path = self.server.socket_path.as_os_str();
        if socket_path.is_empty() {
            return Err(ConfigError::Validation(
                "server.socket_path must not be empty".to_owned(),
            ));
        }
        if socket_path.len() > MAX_SOCKET_PATH_LEN {
            return Err(ConfigError::Validation(format!(
                "server.socket_path is too long: {} > {MAX_SOCKET_PATH_LEN} bytes",
                socket_path.len()
            )));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "server.max_connections must be at least 1".to_owned(),
            ));
        }
        if self.reconcile.interval.is_zero() {
            return Err(ConfigError::Validation(
                "reconcile.interval must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Hook socket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path of the listening socket. Ignored when a listener is inherited
    /// via socket activation.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Maximum concurrent hook connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/nacd/dhcp-script.sock")
}

const fn default_max_connections() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Lease store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file backing the lease store and the
    /// replicated reservation table.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/nacd/nacd.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between automatic soft passes.
    #[serde(default = "default_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Backoff applied to automatic passes after consecutive failures.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Address of the DHCP server to send DHCPRELEASE packets to. When
    /// unset, revokes are logged but no release packet is emitted.
    #[serde(default)]
    pub dhcp_server_ip: Option<Ipv4Addr>,

    /// Local address to send release packets from. When unset, the
    /// operating system chooses.
    #[serde(default)]
    pub release_from_ip: Option<Ipv4Addr>,
}

const fn default_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            backoff: BackoffConfig::default(),
            dhcp_server_ip: None,
            release_from_ip: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(
            config.server.socket_path,
            PathBuf::from("/run/nacd/dhcp-script.sock")
        );
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.reconcile.interval, Duration::from_secs(30));
        assert!(config.reconcile.dhcp_server_ip.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let config = ServiceConfig::from_toml(
            r#"
            [server]
            socket_path = "/tmp/test.sock"
            max_connections = 4

            [database]
            path = "/tmp/test.db"

            [reconcile]
            interval = "5m"
            dhcp_server_ip = "10.66.0.1"

            [reconcile.backoff]
            type = "linear"
            initial_delay = "10s"
            increment = "10s"
            max_delay = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.reconcile.interval, Duration::from_secs(300));
        assert_eq!(
            config.reconcile.dhcp_server_ip,
            Some(Ipv4Addr::new(10, 66, 0, 1))
        );
    }

    #[test]
    fn test_oversized_socket_path_fails_closed() {
        let long = "/tmp/".to_owned() + &"x".repeat(120) + ".sock";
        let toml = format!("[server]\nsocket_path = \"{long}\"\n");
        let err = ServiceConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_zero_interval_fails_closed() {
        let err = ServiceConfig::from_toml("[reconcile]\ninterval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
