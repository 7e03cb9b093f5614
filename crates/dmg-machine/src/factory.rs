//! Per-connection machine construction and ROM resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dmg_core::emulator::{Emulator, EmulatorFactory, EmulatorHandle};
use dmg_core::errors::EmulatorError;
use dmg_core::protocol::RomSource;
use dmg_settings::EmulatorSettings;
use tracing::{debug, warn};

use crate::machine::Machine;

/// Largest accepted ROM image.
pub const MAX_ROM_SIZE: usize = 8 * 1024 * 1024;

/// Machine construction parameters.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Directory named ROMs resolve against.
    pub rom_dir: PathBuf,
    /// ROM loaded into each new machine.
    pub default_rom: Option<String>,
    /// Run-loop tick interval.
    pub tick: Duration,
    /// Instructions per tick.
    pub steps_per_tick: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from(&EmulatorSettings::default())
    }
}

impl From<&EmulatorSettings> for MachineConfig {
    fn from(settings: &EmulatorSettings) -> Self {
        Self {
            rom_dir: PathBuf::from(&settings.rom_dir),
            default_rom: settings.default_rom.clone(),
            tick: Duration::from_micros(settings.run_tick_us.max(1)),
            steps_per_tick: settings.steps_per_tick.max(1),
        }
    }
}

/// Builds one [`Machine`] per connection.
#[derive(Clone, Debug, Default)]
pub struct MachineFactory {
    config: MachineConfig,
}

impl MachineFactory {
    /// Create a factory.
    pub fn new(config: MachineConfig) -> Self {
        Self { config }
    }

    /// The configuration machines are built with.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }
}

impl EmulatorFactory for MachineFactory {
    fn create(&self) -> Result<EmulatorHandle, EmulatorError> {
        let (machine, streams) = Machine::new(self.config.clone());
        if let Some(name) = &self.config.default_rom {
            match machine.load_rom(&RomSource::Named(name.clone())) {
                Ok(()) => debug!(rom = %name, "default rom loaded"),
                // a missing default ROM leaves a blank cartridge
                Err(EmulatorError::RomNotFound(_)) => {
                    warn!(rom = %name, dir = %self.config.rom_dir.display(), "default rom not found");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(EmulatorHandle {
            emulator: Arc::new(machine),
            streams,
        })
    }
}

/// Resolve `name` inside `rom_dir`. Only bare file names are accepted.
pub fn resolve_rom(rom_dir: &Path, name: &str) -> Result<PathBuf, EmulatorError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(EmulatorError::InvalidRom(format!("bad rom name '{name}'")));
    }
    Ok(rom_dir.join(name))
}

/// Read and validate a ROM image.
pub fn read_rom(rom_dir: &Path, source: &RomSource) -> Result<Vec<u8>, EmulatorError> {
    let image = match source {
        RomSource::Bytes(bytes) => bytes.clone(),
        RomSource::Named(name) => {
            let path = resolve_rom(rom_dir, name)?;
            match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(EmulatorError::RomNotFound(name.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    };
    if image.is_empty() {
        return Err(EmulatorError::InvalidRom("empty image".into()));
    }
    if image.len() > MAX_ROM_SIZE {
        return Err(EmulatorError::InvalidRom(format!(
            "image is {} bytes, limit is {MAX_ROM_SIZE}",
            image.len()
        )));
    }
    Ok(image)
}
