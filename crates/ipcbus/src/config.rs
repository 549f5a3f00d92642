// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker and connection configuration.
//!
//! Supports both programmatic and TOML file configuration.

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default broker TCP port.
pub const DEFAULT_PORT: u16 = 7410;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Convert a millisecond delay where negative means "wait forever".
pub fn timeout_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

/// How a socket connector writes frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketBuffer {
    /// Nodelay, flush after every frame.
    Unbuffered,
    /// Coalesce queued frames, flush once the queue drains.
    Delayed,
    /// Buffered writer with this capacity.
    Buffered(usize),
}

/// Where and how to connect (or listen).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// TCP port. Takes precedence over `path` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Unix domain socket path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// TCP host (default: 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,

    /// For a bridge link: wait for the other side to dial in.
    #[serde(default)]
    pub server: bool,

    /// Connect/close deadline in milliseconds; negative waits forever.
    #[serde(default = "default_timeout_delay", alias = "timeoutDelay")]
    pub timeout_delay: i64,

    /// 0 = unbuffered, negative = delayed flush, positive = buffer size.
    #[serde(default, alias = "socketBuffer")]
    pub socket_buffer: i64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout_delay() -> i64 {
    2000
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: None,
            path: None,
            host: default_host(),
            server: false,
            timeout_delay: default_timeout_delay(),
            socket_buffer: 0,
        }
    }
}

impl ConnectOptions {
    pub fn tcp(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_timeout_delay(mut self, ms: i64) -> Self {
        self.timeout_delay = ms;
        self
    }

    pub fn with_socket_buffer(mut self, socket_buffer: i64) -> Self {
        self.socket_buffer = socket_buffer;
        self
    }

    pub fn as_server(mut self) -> Self {
        self.server = true;
        self
    }

    /// Deadline for connect and shutdown; `None` means no deadline.
    pub fn timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.timeout_delay)
    }

    pub fn buffer_mode(&self) -> SocketBuffer {
        match self.socket_buffer {
            0 => SocketBuffer::Unbuffered,
            n if n < 0 => SocketBuffer::Delayed,
            n => SocketBuffer::Buffered(n as usize),
        }
    }

    /// `host:port` when this is a TCP address.
    pub fn tcp_address(&self) -> Option<String> {
        self.port.map(|port| format!("{}:{}", self.host, port))
    }

    pub fn has_address(&self) -> bool {
        self.port.is_some() || self.path.is_some()
    }

    /// Human-readable address for logs.
    pub fn describe(&self) -> String {
        match (&self.tcp_address(), &self.path) {
            (Some(addr), _) => format!("tcp://{}", addr),
            (None, Some(path)) => format!("unix://{}", path.display()),
            (None, None) => "<none>".to_string(),
        }
    }

    /// Validate options used for dialing.
    pub fn validate_dial(&self) -> Result<(), ConfigError> {
        if !self.has_address() {
            return Err(ConfigError::Invalid("port or path required".into()));
        }
        if self.port == Some(0) {
            return Err(ConfigError::Invalid("cannot dial port 0".into()));
        }
        if self.port.is_some() && self.host.is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".into()));
        }
        Ok(())
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker name (for identification in logs and query-state reports).
    #[serde(default = "default_broker_name")]
    pub name: String,

    /// Redial delay after the bridge link drops (ms).
    #[serde(default = "default_bridge_retry")]
    pub bridge_retry_ms: u64,

    /// Traffic log level announced to peers.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Maximum frame size (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum number of peers across all connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Listening address.
    #[serde(default = "default_listen")]
    pub listen: ConnectOptions,

    /// Optional upstream bridge link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ConnectOptions>,
}

fn default_broker_name() -> String {
    "ipcbus-broker".to_string()
}

fn default_listen() -> ConnectOptions {
    ConnectOptions::tcp(DEFAULT_PORT)
}

fn default_bridge_retry() -> u64 {
    1000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_peers() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: default_broker_name(),
            listen: default_listen(),
            bridge: None,
            bridge_retry_ms: default_bridge_retry(),
            log_level: LogLevel::Off,
            max_message_size: default_max_message_size(),
            max_peers: default_max_peers(),
        }
    }
}

impl BrokerConfig {
    /// Configuration listening on `listen`, defaults elsewhere.
    pub fn listening(listen: ConnectOptions) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    pub fn with_bridge(mut self, bridge: ConnectOptions) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn bridge_retry(&self) -> Duration {
        Duration::from_millis(self.bridge_retry_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.listen.has_address() {
            return Err(ConfigError::Invalid(
                "listen requires a port or a path".into(),
            ));
        }
        if self.max_message_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_message_size too small ({})",
                self.max_message_size
            )));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers cannot be 0".into()));
        }

        if let Some(bridge) = &self.bridge {
            if !bridge.server {
                bridge
                    .validate_dial()
                    .map_err(|e| ConfigError::Invalid(format!("bridge: {}", e)))?;

                let same_port = bridge.port.is_some()
                    && bridge.port == self.listen.port
                    && bridge.host == self.listen.host;
                let same_path = bridge.path.is_some() && bridge.path == self.listen.path;
                if same_port || same_path {
                    return Err(ConfigError::Invalid(
                        "bridge points at the broker's own listen address".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}
