//! Client, server and circuit configuration

use crate::error::{Error, Result};
use crate::frame::MAX_FWD_DATA;
use std::time::Duration;

/// Per-circuit configuration, shared by both ends and the relay
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum unacknowledged `FWD` frames in flight per circuit
    pub window: usize,

    /// Inbound bytes buffered before acknowledgements are deferred
    pub read_buffer_capacity: usize,

    /// Bound on every `REQUEST`/`ACCEPT` exchange and the connection hello
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window: 8,
            read_buffer_capacity: 256 * 1024, // 256 KiB
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Check the configuration for values that would stall circuits
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(Error::invalid_config("window must be at least 1"));
        }
        if self.window > usize::from(u16::MAX) / 2 {
            return Err(Error::invalid_config("window exceeds half the sequence space"));
        }
        if self.read_buffer_capacity < MAX_FWD_DATA {
            return Err(Error::invalid_config(
                "read_buffer_capacity must hold at least one full FWD frame",
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::invalid_config("handshake_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Endpoint client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Circuit settings
    pub transport: TransportConfig,

    /// Number of relay servers to hold connections to
    pub min_sessions: usize,

    /// Remotely initiated circuits queued for `accept` before new ones are rejected
    pub accept_buffer: usize,

    /// Delay before reconnecting to a relay after losing the connection
    pub reconnect_backoff: Duration,

    /// Encoded frames queued per physical connection before producers wait
    pub link_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            min_sessions: 1,
            accept_buffer: 20,
            reconnect_backoff: Duration::from_secs(5),
            link_queue: 64,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.min_sessions == 0 {
            return Err(Error::invalid_config("min_sessions must be at least 1"));
        }
        if self.accept_buffer == 0 {
            return Err(Error::invalid_config("accept_buffer must be at least 1"));
        }
        if self.link_queue == 0 {
            return Err(Error::invalid_config("link_queue must be at least 1"));
        }
        Ok(())
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Circuit settings (only the handshake timeout applies on the relay)
    pub transport: TransportConfig,

    /// Maximum concurrently connected clients
    pub max_sessions: usize,

    /// Encoded frames queued per physical connection before forwarding waits
    pub link_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_sessions: 2048,
            link_queue: 64,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.max_sessions == 0 {
            return Err(Error::invalid_config("max_sessions must be at least 1"));
        }
        if self.link_queue == 0 {
            return Err(Error::invalid_config("link_queue must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TransportConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = TransportConfig {
            window: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_small_read_buffer_rejected() {
        let config = ClientConfig {
            transport: TransportConfig {
                read_buffer_capacity: 1024,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_sessions() {
        let config = ServerConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
