//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Registered emulator sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Emulator factory failures (counter).
pub const SESSION_CREATE_FAILURES_TOTAL: &str = "session_create_failures_total";
/// Decoded commands (counter, labels: command).
pub const COMMANDS_TOTAL: &str = "commands_total";
/// Commands the emulator rejected (counter, labels: command).
pub const COMMAND_ERRORS_TOTAL: &str = "command_errors_total";
/// Inbound frames that failed to decode (counter).
pub const DECODE_ERRORS_TOTAL: &str = "decode_errors_total";
/// Notifications queued for a client (counter, labels: type).
pub const NOTIFICATIONS_SENT_TOTAL: &str = "notifications_sent_total";
/// Notifications dropped because they failed to encode (counter).
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "notifications_dropped_total";
/// Step drains that hit their deadline (counter).
pub const STEP_DRAIN_TIMEOUTS_TOTAL: &str = "step_drain_timeouts_total";
/// Active run loops (gauge).
pub const RUN_LOOPS_ACTIVE: &str = "run_loops_active";
