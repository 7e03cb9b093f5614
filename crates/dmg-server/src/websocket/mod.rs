//! WebSocket session handling: the single writer, command dispatch, state
//! fan-in and the per-connection lifecycle.

pub mod connection;
pub mod dispatcher;
pub mod multiplexer;
pub mod session;
