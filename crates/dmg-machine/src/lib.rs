//! # dmg-machine
//!
//! A minimal machine behind the [`dmg_core::Emulator`] contract: a 64 KiB
//! bus, a handful of SM83 opcodes, scanline timing, joypad register and
//! save slots. Enough for the host to run and for its end-to-end tests.

#![deny(unsafe_code)]

pub mod cpu;
pub mod factory;
pub mod machine;
pub mod memory;

pub use factory::{MachineConfig, MachineFactory};
pub use machine::Machine;
