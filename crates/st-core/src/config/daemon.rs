//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the tunnel daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the control listener binds to; `validate()` rejects
    /// anything but a loopback IP or `localhost`
    pub listen_address: String,

    /// Control listener port
    pub listen_port: u16,

    /// Read buffer capacity for control connections
    pub buffer_size: usize,

    /// Upper bound on a single control request
    pub max_request_bytes: usize,

    /// How long a control client may take to send its command
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// First local port handed out for tunnels (inclusive)
    pub min_port_range: u16,

    /// End of the local tunnel port range (exclusive)
    pub max_port_range: u16,

    /// Address the per-tunnel listen sockets bind to
    pub tunnel_bind_address: String,

    /// Maximum tunnel age before the expiry monitor closes it
    #[serde(with = "duration_secs")]
    pub tunnel_expiration: Duration,

    /// Bound on TCP connect and SSH handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Log every inbound command (with secrets masked)
    pub debug_json_messages: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 500,
            buffer_size: 8192,
            max_request_bytes: 64 * 1024,
            request_timeout: Duration::from_secs(30),
            min_port_range: 10000,
            max_port_range: 20000,
            tunnel_bind_address: "127.0.0.1".to_string(),
            tunnel_expiration: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            debug_json_messages: false,
        }
    }
}

impl DaemonConfig {
    /// Get the control listener address (host:port)
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    /// Number of ports in the tunnel range
    pub fn port_range_size(&self) -> usize {
        usize::from(self.max_port_range.saturating_sub(self.min_port_range))
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let loopback = self.listen_address == "localhost"
            || self
                .listen_address
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        if !loopback {
            return Err(ConfigError::Invalid(format!(
                "listen_address must be a loopback address, got {:?}",
                self.listen_address
            )));
        }
        if self.min_port_range == 0 {
            return Err(ConfigError::Invalid(
                "min_port_range must be greater than 0".to_string(),
            ));
        }
        if self.min_port_range >= self.max_port_range {
            return Err(ConfigError::Invalid(format!(
                "min_port_range ({}) must be below max_port_range ({})",
                self.min_port_range, self.max_port_range
            )));
        }
        if self.tunnel_expiration.is_zero() {
            return Err(ConfigError::Invalid(
                "tunnel_expiration must be at least one second".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero".to_string()));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_request_bytes must be non-zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}
