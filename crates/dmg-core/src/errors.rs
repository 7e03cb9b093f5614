//! Error types for the wire codec and the emulator facade.

use thiserror::Error;

/// Failures while decoding or encoding a wire envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not a JSON object with an unsigned integer `type`.
    #[error("invalid envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The `type` discriminant is not a known command.
    #[error("unknown message type {0}")]
    UnknownType(u64),

    /// The `data` field does not match the schema of its `type`.
    #[error("invalid data for {kind}: {source}")]
    InvalidData {
        /// Name of the message type whose data failed to decode.
        kind: &'static str,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// A payload could not be serialized.
    #[error("failed to encode {kind}: {source}")]
    Encode {
        /// Name of the message type being encoded.
        kind: &'static str,
        /// Underlying encode failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Failures reported by an emulator facade operation.
///
/// These are surfaced to the client as `error` notifications; none of them
/// end the session.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// The ROM identifier did not resolve to a readable image.
    #[error("rom not found: {0}")]
    RomNotFound(String),

    /// The ROM image was rejected.
    #[error("invalid rom: {0}")]
    InvalidRom(String),

    /// No breakpoint exists at the address.
    #[error("no breakpoint at 0x{0:04X}")]
    BreakpointNotFound(u16),

    /// The save slot is empty.
    #[error("save slot {0} is empty")]
    EmptySlot(u8),

    /// The emulator cannot carry out the operation.
    #[error("emulator fault: {0}")]
    Fault(String),

    /// The emulator has been shut down.
    #[error("emulator is shut down")]
    ShutDown,

    /// Filesystem failure while loading a ROM.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
