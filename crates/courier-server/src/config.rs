//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use courier_core::BrokerConfig;
use courier_protocol::ChannelKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the HTTP surface (WebSocket upgrade + long-polling).
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port for the raw TCP transport.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Greeting pushed to every new connection.
    #[serde(default = "default_motd")]
    pub motd: String,

    /// The reserved broadcast-sink channel key.
    #[serde(default = "default_wildcard")]
    pub wildcard_channel: String,

    /// Transport enable flags.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Liveness push configuration for persistent connections.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Long-polling session configuration.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Enable the raw TCP transport.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Enable the HTTP long-polling transport.
    #[serde(default = "default_true")]
    pub polling: bool,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Liveness push configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between `ping` pushes on persistent connections.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

/// Long-polling session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds without a request before a polling session is destroyed.
    #[serde(default = "default_polling_expiry")]
    pub expiry_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_http_port() -> u16 {
    std::env::var("COURIER_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_tcp_port() -> u16 {
    std::env::var("COURIER_TCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081)
}

fn default_motd() -> String {
    "courier".to_string()
}

fn default_wildcard() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_ping_interval() -> u64 {
    10
}

fn default_polling_expiry() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            tcp_port: default_tcp_port(),
            motd: default_motd(),
            wildcard_channel: default_wildcard(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            polling: PollingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            tcp: true,
            polling: true,
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_polling_expiry(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The socket address of the HTTP surface.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable host.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.http_port))
    }

    /// The socket address of the TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable host.
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.tcp_port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.tcp_port))
    }

    /// The broker configuration slice of this config.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            wildcard_channel: ChannelKey::Name(self.wildcard_channel.clone()),
            motd: self.motd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.wildcard_channel, "*");
        assert!(config.transport.websocket);
        assert!(config.transport.tcp);
        assert!(config.transport.polling);
        assert_eq!(config.heartbeat.ping_interval_secs, 10);
        assert_eq!(config.polling.expiry_secs, 60);
    }

    #[test]
    fn test_config_addrs() {
        let config = Config::default();
        assert_eq!(config.http_addr().unwrap().port(), 8080);
        assert_eq!(config.tcp_addr().unwrap().port(), 8081);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r##"
            host = "0.0.0.0"
            http_port = 9000
            motd = "welcome"
            wildcard_channel = "#"

            [transport]
            tcp = false

            [polling]
            expiry_secs = 120
        "##;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.motd, "welcome");
        assert!(!config.transport.tcp);
        assert!(config.transport.websocket);
        assert_eq!(config.polling.expiry_secs, 120);

        let broker = config.broker_config();
        assert_eq!(broker.wildcard_channel, ChannelKey::from("#"));
    }
}
