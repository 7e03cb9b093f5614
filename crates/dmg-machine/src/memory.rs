//! Flat 64 KiB address space with named regions and a write log.

use dmg_core::state::MemoryWrite;

/// Size of the cartridge ROM window.
pub const ROM_WINDOW: usize = 0x8000;

/// Joypad register.
pub const P1: u16 = 0xFF00;
/// Sound master volume.
pub const NR50: u16 = 0xFF24;
/// Sound panning.
pub const NR51: u16 = 0xFF25;
/// Sound on/off.
pub const NR52: u16 = 0xFF26;
/// LCD control.
pub const LCDC: u16 = 0xFF40;
/// LCD status.
pub const STAT: u16 = 0xFF41;
/// Background scroll Y.
pub const SCY: u16 = 0xFF42;
/// Background scroll X.
pub const SCX: u16 = 0xFF43;
/// Current scanline.
pub const LY: u16 = 0xFF44;
/// Interrupt enable.
pub const IE: u16 = 0xFFFF;

/// Named regions, in address order: `(name, start, end inclusive)`.
pub const REGIONS: [(&str, u16, u16); 10] = [
    ("ROM", 0x0000, 0x7FFF),
    ("VRAM", 0x8000, 0x9FFF),
    ("ERAM", 0xA000, 0xBFFF),
    ("WRAM", 0xC000, 0xDFFF),
    ("ECHO", 0xE000, 0xFDFF),
    ("OAM", 0xFE00, 0xFE9F),
    ("UNUSABLE", 0xFEA0, 0xFEFF),
    ("IO", 0xFF00, 0xFF7F),
    ("HRAM", 0xFF80, 0xFFFE),
    ("IE", 0xFFFF, 0xFFFF),
];

/// Regions dumped for the initial client sync.
const ATTACHED: [&str; 6] = ["ROM", "VRAM", "WRAM", "OAM", "IO", "HRAM"];

/// Name of the region containing `address`.
pub fn region_name(address: u16) -> &'static str {
    REGIONS
        .iter()
        .find(|(_, start, end)| (*start..=*end).contains(&address))
        .map_or("IE", |(name, _, _)| name)
}

/// The address space.
#[derive(Clone)]
pub struct Bus {
    bytes: Vec<u8>,
    writes: Vec<MemoryWrite>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Zeroed memory with post-boot I/O register values.
    pub fn new() -> Self {
        let mut bus = Self {
            bytes: vec![0; 0x1_0000],
            writes: Vec::new(),
        };
        bus.power_on_io();
        bus
    }

    fn power_on_io(&mut self) {
        for (address, value) in [
            (P1, 0xCF),
            (NR50, 0x77),
            (NR51, 0xF3),
            (NR52, 0xF1),
            (LCDC, 0x91),
            (STAT, 0x85),
        ] {
            self.bytes[usize::from(address)] = value;
        }
    }

    /// Clear RAM and I/O, keeping the cartridge window.
    pub fn reset(&mut self) {
        self.bytes[ROM_WINDOW..].fill(0);
        self.power_on_io();
        self.writes.clear();
    }

    /// Map a ROM image into the cartridge window. Bytes past the window are
    /// ignored; a short image leaves the rest zeroed.
    pub fn map_rom(&mut self, image: &[u8]) {
        let len = image.len().min(ROM_WINDOW);
        self.bytes[..ROM_WINDOW].fill(0);
        self.bytes[..len].copy_from_slice(&image[..len]);
    }

    /// Read one byte.
    pub fn read(&self, address: u16) -> u8 {
        self.bytes[usize::from(address)]
    }

    /// Read a little-endian word.
    pub fn read_word(&self, address: u16) -> u16 {
        u16::from_le_bytes([self.read(address), self.read(address.wrapping_add(1))])
    }

    /// Program write. Writes into the cartridge window are dropped (no bank
    /// controller); everything else is applied and logged.
    pub fn write(&mut self, address: u16, value: u8) {
        if usize::from(address) < ROM_WINDOW {
            return;
        }
        self.set(address, value);
    }

    /// Hardware-side write (registers updated by the video or joypad units).
    pub fn set(&mut self, address: u16, value: u8) {
        let slot = &mut self.bytes[usize::from(address)];
        if *slot == value {
            return;
        }
        *slot = value;
        self.writes.push(MemoryWrite {
            name: region_name(address).to_string(),
            address,
            data: vec![value],
        });
    }

    /// Take the writes logged since the last call.
    pub fn take_writes(&mut self) -> Vec<MemoryWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Dumps of the regions a client mirrors.
    pub fn attached(&self) -> Vec<MemoryWrite> {
        REGIONS
            .iter()
            .filter(|(name, _, _)| ATTACHED.contains(name))
            .map(|(name, start, end)| MemoryWrite {
                name: (*name).to_string(),
                address: *start,
                data: self.bytes[usize::from(*start)..=usize::from(*end)].to_vec(),
            })
            .collect()
    }

    /// Copy of the raw bytes, for save slots.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Restore raw bytes from a save slot.
    pub fn restore(&mut self, bytes: &[u8]) {
        self.bytes.copy_from_slice(bytes);
        self.writes.clear();
    }
}
