//! Configuration Types
//!
//! `TunnelDefinition` is the on-disk record written by the configuration
//! editor. `TunnelConfig` is the flat, immutable value a running tunnel is
//! built from. `TunnelSettings` carries the runtime knobs shared by every
//! tunnel a manager creates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use zeroize::Zeroize;

/// Address every forwarded port is bound on locally
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Errors raised when a definition cannot be turned into a tunnel config
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("{0} is empty")]
    MissingField(&'static str),

    #[error("{field} is not a valid port: {value}")]
    InvalidPort { field: &'static str, value: String },
}

/// A persisted tunnel definition
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelDefinition {
    /// Stable external name of the tunnel
    #[serde(default)]
    pub identifier: String,
    /// Name of the backing file inside the store directory
    #[serde(default)]
    pub file_name: String,
    /// Display name
    #[serde(default)]
    pub config_name: String,
    pub remote_ip: String,
    pub remote_port: String,
    pub server_ip: String,
    pub server_port: String,
    pub user_name: String,
    pub password: String,
}

impl TunnelDefinition {
    /// Check every field the tunnel needs
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let required = [
            ("remote ip", &self.remote_ip),
            ("remote port", &self.remote_port),
            ("server ip", &self.server_ip),
            ("server port", &self.server_port),
            ("username", &self.user_name),
            ("password", &self.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DefinitionError::MissingField(field));
            }
        }

        parse_port("remote port", &self.remote_port)?;
        parse_port("server port", &self.server_port)?;
        Ok(())
    }

    /// Build the flat tunnel config.
    ///
    /// The local side listens on the loopback address using the same port as
    /// the remote destination.
    pub fn to_config(&self) -> Result<TunnelConfig, DefinitionError> {
        self.validate()?;
        let remote_port = parse_port("remote port", &self.remote_port)?;
        let server_port = parse_port("server port", &self.server_port)?;

        Ok(TunnelConfig {
            username: self.user_name.trim().to_string(),
            password: self.password.clone(),
            local_addr: format!("{}:{}", DEFAULT_BIND_HOST, remote_port),
            server_addr: format!("{}:{}", self.server_ip.trim(), server_port),
            remote_addr: format!("{}:{}", self.remote_ip.trim(), remote_port),
        })
    }

    /// Display name, falling back to `remote_ip:remote_port`
    pub fn display_name(&self) -> String {
        if self.config_name.is_empty() {
            format!("{}:{}", self.remote_ip, self.remote_port)
        } else {
            self.config_name.clone()
        }
    }
}

impl std::fmt::Debug for TunnelDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDefinition")
            .field("identifier", &self.identifier)
            .field("file_name", &self.file_name)
            .field("config_name", &self.config_name)
            .field("remote_ip", &self.remote_ip)
            .field("remote_port", &self.remote_port)
            .field("server_ip", &self.server_ip)
            .field("server_port", &self.server_port)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, DefinitionError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| DefinitionError::InvalidPort {
            field,
            value: value.to_string(),
        })
}

/// Immutable configuration of a single tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Username for relay authentication
    pub username: String,
    /// Password for relay authentication, never logged
    pub password: String,
    /// Local bind address for accepted connections
    pub local_addr: String,
    /// SSH relay host (`host:port`)
    pub server_addr: String,
    /// Final destination dialed through the relay (`host:port`)
    pub remote_addr: String,
}

impl TunnelConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        local_addr: impl Into<String>,
        server_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            local_addr: local_addr.into(),
            server_addr: server_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("local_addr", &self.local_addr)
            .field("server_addr", &self.server_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl Drop for TunnelConfig {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// What the keepalive monitor does when a liveness probe fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KeepalivePolicy {
    /// Stop the tunnel on the first failed probe
    #[default]
    StopOnFailure,
    /// Re-run the connect sequence up to `max_attempts` times, then stop
    Reconnect { max_attempts: u32 },
}

/// Runtime knobs applied to every tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Maximum number of concurrently forwarded connections per tunnel
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// SSH handshake timeout per attempt
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// SSH connect attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between connect attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Interval between keepalive probes
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    #[serde(default)]
    pub keepalive_policy: KeepalivePolicy,

    /// Copy buffer size per direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Close a forwarded connection after this long without reading anything.
    /// `None` keeps connections open until a peer closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

fn default_max_connections() -> usize {
    20
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_buffer_size() -> usize {
    32 * 1024
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_policy: KeepalivePolicy::default(),
            buffer_size: default_buffer_size(),
            idle_timeout_ms: None,
        }
    }
}

impl TunnelSettings {
    /// Concurrency cap handed to the accept loop's semaphore.
    ///
    /// `0` is treated as `1`; anything above the semaphore's permit ceiling
    /// is clamped to it.
    pub fn connection_limit(&self) -> usize {
        self.max_connections.clamp(1, Semaphore::MAX_PERMITS)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Application configuration file (`config.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: TunnelSettings,

    /// Override for the tunnel definition directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnels_dir: Option<std::path::PathBuf>,
}
