//! Configuration file for the relay daemon.

use dmsg::{SecretKey, ServerConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay settings
    #[serde(default)]
    pub server: RelaySection,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Address the relay listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Relay secret key (hex); a fresh key is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Maximum concurrently connected clients
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Hello and circuit handshake timeout
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", dmsg::DEFAULT_SERVER_PORT)
}

fn default_max_sessions() -> usize {
    ServerConfig::default().max_sessions
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            secret_key: None,
            max_sessions: default_max_sessions(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Configured key, or a freshly generated one
    ///
    /// # Errors
    ///
    /// Returns an error if the configured key is not valid hex.
    pub fn secret_key(&self) -> anyhow::Result<SecretKey> {
        match &self.server.secret_key {
            Some(hex) => Ok(SecretKey::from_hex(hex)?),
            None => Ok(SecretKey::generate()),
        }
    }

    /// Library configuration for the relay
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            transport: TransportConfig {
                handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
                ..TransportConfig::default()
            },
            max_sessions: self.server.max_sessions,
            ..ServerConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;

        if let Some(hex) = &self.server.secret_key {
            SecretKey::from_hex(hex)
                .map_err(|e| anyhow::anyhow!("Invalid secret key: {}", e))?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.server_config().validate()?;
        Ok(())
    }
}
