//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Seconds to wait for sessions to drain on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024, // 1 MB
            shutdown_timeout_secs: 10,
        }
    }
}
