//! A deliberately small SM83 subset.
//!
//! Supported: `NOP`, `JP a16`, `JR e8`, `LD A,n8`, `LD (a16),A`,
//! `LDH (a8),A`, `INC A`, `DEC A`, `XOR A`, `HALT`, `DI`, `EI` and the
//! `0xCB` prefix (fetched, not executed). Anything else executes as `NOP`.

use dmg_core::state::ProcessorState;

use crate::memory::{Bus, IE};

const FLAG_Z: u8 = 0x80;
const FLAG_N: u8 = 0x40;
const FLAG_H: u8 = 0x20;

/// Register file, initialised to the post-boot-ROM values.
#[derive(Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cpu {
    pub(crate) pc: u16,
    pub(crate) sp: u16,
    pub(crate) a: u8,
    pub(crate) f: u8,
    pub(crate) bc: u16,
    pub(crate) de: u16,
    pub(crate) hl: u16,
    pub(crate) ir: u8,
    pub(crate) prefixed: bool,
    pub(crate) operand: u16,
    pub(crate) ime: bool,
    pub(crate) halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            pc: 0x0100,
            sp: 0xFFFE,
            a: 0x01,
            f: 0xB0,
            bc: 0x0013,
            de: 0x00D8,
            hl: 0x014D,
            ir: 0x00,
            prefixed: false,
            operand: 0,
            ime: false,
            halted: false,
        }
    }
}

impl Cpu {
    fn fetch(&mut self, bus: &Bus) -> u8 {
        let byte = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self, bus: &Bus) -> u16 {
        let word = bus.read_word(self.pc);
        self.pc = self.pc.wrapping_add(2);
        word
    }

    /// Execute one instruction, returning the clock cycles it took.
    ///
    /// A halted CPU stays in place and burns 4 cycles.
    pub fn step(&mut self, bus: &mut Bus) -> u32 {
        if self.halted {
            return 4;
        }
        self.prefixed = false;
        self.ir = self.fetch(bus);
        match self.ir {
            0xC3 => {
                self.operand = self.fetch_word(bus);
                self.pc = self.operand;
                16
            }
            0x18 => {
                let offset = self.fetch(bus);
                self.operand = u16::from(offset);
                self.pc = self
                    .pc
                    .wrapping_add_signed(i16::from(i8::from_ne_bytes([offset])));
                12
            }
            0x3E => {
                let value = self.fetch(bus);
                self.operand = u16::from(value);
                self.a = value;
                8
            }
            0xEA => {
                self.operand = self.fetch_word(bus);
                bus.write(self.operand, self.a);
                16
            }
            0xE0 => {
                let low = self.fetch(bus);
                self.operand = 0xFF00 | u16::from(low);
                bus.write(self.operand, self.a);
                12
            }
            0x3C => {
                let half = self.a & 0x0F == 0x0F;
                self.a = self.a.wrapping_add(1);
                self.set_flags(self.a == 0, false, half);
                4
            }
            0x3D => {
                let half = self.a & 0x0F == 0x00;
                self.a = self.a.wrapping_sub(1);
                self.set_flags(self.a == 0, true, half);
                4
            }
            0xAF => {
                self.a = 0;
                self.f = FLAG_Z;
                4
            }
            0x76 => {
                self.halted = true;
                4
            }
            0xF3 => {
                self.ime = false;
                4
            }
            0xFB => {
                self.ime = true;
                4
            }
            0xCB => {
                self.prefixed = true;
                self.ir = self.fetch(bus);
                8
            }
            _ => 4,
        }
    }

    fn set_flags(&mut self, zero: bool, subtract: bool, half: bool) {
        let carry = self.f & 0x10;
        self.f = carry;
        if zero {
            self.f |= FLAG_Z;
        }
        if subtract {
            self.f |= FLAG_N;
        }
        if half {
            self.f |= FLAG_H;
        }
    }

    /// Snapshot for the processor stream.
    pub fn state(&self, bus: &Bus) -> ProcessorState {
        ProcessorState {
            pc: self.pc,
            sp: self.sp,
            a: self.a,
            f: self.f,
            bc: self.bc,
            de: self.de,
            hl: self.hl,
            prefixed: self.prefixed,
            ir: self.ir,
            operand_value: self.operand,
            ie: bus.read(IE),
            ime: self.ime,
            halted: self.halted,
            ..ProcessorState::default()
        }
        .with_flags_from_f()
    }
}
