//! # dmg-core
//!
//! Foundation types shared by the emulator host.
//!
//! - [`protocol`]: the `{type, data}` wire envelope for commands and notifications
//! - [`state`]: emulator state snapshots carried by notifications
//! - [`emulator`]: the facade contract an emulator implements to be hosted
//! - [`errors`]: codec and facade error types
//! - [`ids`]: connection identifiers
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod emulator;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod state;

pub use emulator::{Emulator, EmulatorFactory, EmulatorHandle, StateSinks, StateStreams};
pub use errors::{EmulatorError, ProtocolError};
pub use ids::ConnectionId;
pub use protocol::{Command, CommandType, Notification, NotificationType, RomSource};
