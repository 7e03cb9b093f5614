//! # dmg-server
//!
//! Axum HTTP + `WebSocket` host for per-connection emulator sessions.
//!
//! - `WebSocket` gateway: one emulator per connection, command dispatch,
//!   state fan-in, single outbound writer with heartbeat
//! - Session registry for health, shutdown and cleanup
//! - HTTP endpoints: health check, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::DmgServer;
