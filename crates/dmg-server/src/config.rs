//! Server configuration.

use std::time::Duration;

use dmg_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`DmgServer`](crate::server::DmgServer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// WebSocket route.
    pub route: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close the connection after this long without a pong.
    pub heartbeat_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Deadline for the state events that follow a step.
    pub step_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            route: "/gameboy".into(),
            max_connections: 64,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            max_message_size: 1024 * 1024,
            outbound_queue: 1024,
            step_timeout_ms: 2_000,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            route: settings.route.clone(),
            max_connections: settings.max_connections,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            heartbeat_timeout_ms: settings.heartbeat_timeout_ms,
            max_message_size: settings.max_message_size,
            outbound_queue: settings.outbound_queue,
            step_timeout_ms: settings.step_timeout_ms,
        }
    }
}

impl ServerConfig {
    /// Ping period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Pong deadline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Step drain deadline.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}
