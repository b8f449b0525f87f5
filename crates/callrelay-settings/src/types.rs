//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file may specify any subset of fields.

use serde::{Deserialize, Serialize};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 9000, "maxConnections": 500 },
///   "logging": { "level": "debug", "json": true }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network and connection limits.
    pub server: ServerSettings,
    /// Log output configuration.
    pub logging: LoggingSettings,
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before new frames are dropped.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
    /// How long shutdown waits for open connections to drain, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            send_queue_capacity: 256,
            max_message_bytes: 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Log level names accepted in settings files and `CALLRELAY_LOG_LEVEL`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse a level name (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence when set.
    pub level: LogLevel,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}
