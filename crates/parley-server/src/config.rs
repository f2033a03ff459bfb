//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (first of `parley.toml`, `/etc/parley/parley.toml`,
//!   `~/.config/parley/parley.toml`)
//! - Environment variables (`PARLEY_PORT`, `PARLEY_BUS__SUBSCRIBER_CAPACITY`, ...)

use ::config::{Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

const ENV_PREFIX: &str = "PARLEY";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid bind address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub bus: BusSettings,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum live subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Undelivered events a subscriber may accumulate before it is dropped.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds, advertised to clients.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a connection is dropped, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            bus: BusSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result fails validation.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists());

        Self::build(path.as_deref())
    }

    /// Load configuration from a specific file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::build(Some(path))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let source = path.map_or_else(|| "environment".to_string(), |p| p.display().to_string());
        let config: Config = builder
            .build()
            .with_context(|| format!("Failed to load configuration from {source}"))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse configuration from {source}"))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus.subscriber_capacity must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.timeout_ms < self.heartbeat.interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat.timeout_ms must not be shorter than heartbeat.interval_ms".to_string(),
            ));
        }
        if !self.transport.websocket_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "transport.websocket_path must start with '/'".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if host and port do not form
    /// a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|source| ConfigError::InvalidAddress { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.bus.subscriber_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            bad.bind_addr(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [bus]
            subscriber_capacity = 32

            [limits]
            max_subscriptions_per_connection = 8
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bus.subscriber_capacity, 32);
        assert_eq!(config.limits.max_subscriptions_per_connection, 8);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!("parley-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "port = 9100\n[heartbeat]\ninterval_ms = 1000\ntimeout_ms = 5000\n")
            .unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_missing_file_rejected() {
        let path = std::env::temp_dir().join(format!("parley-{}.toml", uuid::Uuid::new_v4()));
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.bus.subscriber_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
