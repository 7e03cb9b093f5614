//! Emulator state snapshots carried by outbound notifications.
//!
//! Field names on the wire are upper-case register names (`PC`, `LY`,
//! `NR52`, ...) because that is what existing debugger front-ends render.

use serde::{Deserialize, Serialize};

/// Processor registers after an instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::struct_excessive_bools)]
pub struct ProcessorState {
    /// Program counter.
    pub pc: u16,
    /// Stack pointer.
    pub sp: u16,
    /// Accumulator.
    pub a: u8,
    /// Flag register (Z=bit 7, N=bit 6, H=bit 5, C=bit 4).
    pub f: u8,
    /// Zero flag.
    pub z: bool,
    /// Subtraction flag.
    pub n: bool,
    /// Half-carry flag.
    pub h: bool,
    /// Carry flag.
    pub c: bool,
    /// BC register pair.
    pub bc: u16,
    /// DE register pair.
    pub de: u16,
    /// HL register pair.
    pub hl: u16,
    /// Whether the current instruction carries the `0xCB` prefix.
    pub prefixed: bool,
    /// Instruction register (last fetched opcode).
    pub ir: u8,
    /// Last operand fetched for the current instruction.
    pub operand_value: u16,
    /// Interrupt enable register.
    pub ie: u8,
    /// Interrupt master enable.
    pub ime: bool,
    /// Whether the CPU is halted.
    pub halted: bool,
}

impl ProcessorState {
    /// Rebuild the individual flag booleans from `f`.
    #[must_use]
    pub fn with_flags_from_f(mut self) -> Self {
        self.z = self.f & 0x80 != 0;
        self.n = self.f & 0x40 != 0;
        self.h = self.f & 0x20 != 0;
        self.c = self.f & 0x10 != 0;
        self
    }
}

/// LCD controller mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PpuMode {
    /// Mode 0.
    #[default]
    HBlank,
    /// Mode 1.
    VBlank,
    /// Mode 2.
    OamScan,
    /// Mode 3.
    Drawing,
}

/// Video unit registers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct VideoState {
    /// Current scanline.
    pub ly: u8,
    /// LCD control.
    pub lcdc: u8,
    /// LCD status.
    pub stat: u8,
    /// Background scroll Y.
    pub scy: u8,
    /// Background scroll X.
    pub scx: u8,
    /// Current controller mode.
    pub mode: PpuMode,
    /// Completed frames since power-on.
    pub frame: u64,
}

/// Audio unit master registers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AudioState {
    /// Master volume / VIN panning.
    pub nr50: u8,
    /// Sound panning.
    pub nr51: u8,
    /// Sound on/off.
    pub nr52: u8,
    /// Whether the audio unit is powered.
    pub enabled: bool,
}

/// A contiguous run of bytes in a named memory region.
///
/// Used both for the initial memory-map dump and for per-step write deltas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWrite {
    /// Region name (`"ROM"`, `"WRAM"`, `"HRAM"`, ...).
    pub name: String,
    /// Start address of `data`.
    pub address: u16,
    /// Bytes starting at `address`.
    pub data: Vec<u8>,
}

/// Button state submitted by the client and acknowledged by the emulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct JoypadState {
    /// D-pad up.
    pub up: bool,
    /// D-pad down.
    pub down: bool,
    /// D-pad left.
    pub left: bool,
    /// D-pad right.
    pub right: bool,
    /// A button.
    pub a: bool,
    /// B button.
    pub b: bool,
    /// Select button.
    pub select: bool,
    /// Start button.
    pub start: bool,
}

/// Why a continuous run ended without being asked to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// An enabled breakpoint matched the program counter.
    Breakpoint {
        /// Breakpoint address.
        address: u16,
    },
    /// Execution was stopped on request.
    Stopped,
    /// The emulator could not continue.
    Fault {
        /// Human-readable cause.
        message: String,
    },
}

/// Final event of a run loop, delivered on the halted stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHalted {
    /// Why execution halted.
    pub reason: HaltReason,
    /// Program counter at the halt.
    #[serde(rename = "PC")]
    pub pc: u16,
}

/// A breakpoint as held by the facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Address that halts execution.
    pub address: u16,
    /// Disabled breakpoints are kept but never halt.
    pub enabled: bool,
}
