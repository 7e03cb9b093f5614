//! Settings types.
//!
//! Every struct uses `#[serde(default)]`, so a settings file only needs the
//! keys it overrides.

use dmg_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSettings {
    /// Network and session settings.
    pub server: ServerSettings,
    /// Emulator factory settings.
    pub emulator: EmulatorSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl HostSettings {
    /// Reject values the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !self.server.route.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.route must start with '/': {}",
                self.server.route
            )));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundQueue must be at least 1".into(),
            ));
        }
        if self.emulator.steps_per_tick == 0 {
            return Err(SettingsError::InvalidValue(
                "emulator.stepsPerTick must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// WebSocket route.
    pub route: String,
    /// Maximum concurrent sessions; further upgrades are refused.
    pub max_connections: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close the connection after this long without a pong.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Deadline for the events that follow a single step.
    pub step_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            route: "/gameboy".to_string(),
            max_connections: 64,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            max_message_size: 1024 * 1024,
            outbound_queue: 1024,
            step_timeout_ms: 2_000,
        }
    }
}

/// Emulator factory settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmulatorSettings {
    /// Directory that named ROMs are resolved against.
    pub rom_dir: String,
    /// ROM loaded into every new session, if any.
    pub default_rom: Option<String>,
    /// Interval between run-loop ticks in microseconds.
    pub run_tick_us: u64,
    /// Instructions executed per run-loop tick.
    pub steps_per_tick: u32,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            rom_dir: "roms".to_string(),
            default_rom: Some("tetris.gb".to_string()),
            run_tick_us: 16_742,
            steps_per_tick: 1,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
