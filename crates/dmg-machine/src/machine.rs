//! [`Machine`]: the reference [`Emulator`].
//!
//! All state lives in one [`Core`] behind a mutex. Every state event is sent
//! while that lock is held, so once [`Emulator::stop`] has taken the lock and
//! cleared the running flag, the run loop can neither execute nor emit again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dmg_core::emulator::{Emulator, StateSinks, StateStreams, state_channels};
use dmg_core::errors::EmulatorError;
use dmg_core::protocol::RomSource;
use dmg_core::state::{
    AudioState, Breakpoint, HaltReason, JoypadState, MemoryWrite, PpuMode, RunHalted, VideoState,
};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cpu::Cpu;
use crate::factory::{MachineConfig, read_rom};
use crate::memory::{self, Bus};

const DOTS_PER_LINE: u64 = 456;
const LINES_PER_FRAME: u64 = 154;
const VISIBLE_LINES: u64 = 144;

#[derive(Clone)]
struct Snapshot {
    cpu: Cpu,
    memory: Vec<u8>,
    dots: u64,
}

struct Core {
    cpu: Cpu,
    bus: Bus,
    rom: Vec<u8>,
    dots: u64,
    breakpoints: BTreeMap<u16, bool>,
    slots: HashMap<u8, Snapshot>,
    pending_joypad: Option<JoypadState>,
    running: bool,
    run_epoch: u64,
    shut_down: bool,
    sinks: StateSinks,
}

impl Core {
    fn alive(&self) -> Result<(), EmulatorError> {
        if self.shut_down {
            Err(EmulatorError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn power_on(&mut self) {
        self.cpu = Cpu::default();
        self.bus.map_rom(&self.rom);
        self.bus.reset();
        self.dots = 0;
    }

    fn execute(&mut self) {
        self.apply_joypad();
        let cycles = self.cpu.step(&mut self.bus);
        self.dots += u64::from(cycles);
        self.update_video();
        self.emit();
    }

    fn apply_joypad(&mut self) {
        let Some(pad) = self.pending_joypad.take() else {
            return;
        };
        let select = self.bus.read(memory::P1) & 0x30;
        self.bus.set(memory::P1, 0xC0 | select | p1_nibble(select, pad));
        let _ = self.sinks.input.send(pad);
    }

    fn update_video(&mut self) {
        let line = self.dots / DOTS_PER_LINE % LINES_PER_FRAME;
        let ly = u8::try_from(line).unwrap_or(0);
        self.bus.set(memory::LY, ly);
        let stat = (self.bus.read(memory::STAT) & !0x03) | mode_bits(self.mode());
        self.bus.set(memory::STAT, stat);
    }

    fn mode(&self) -> PpuMode {
        let line = self.dots / DOTS_PER_LINE % LINES_PER_FRAME;
        let dot = self.dots % DOTS_PER_LINE;
        if line >= VISIBLE_LINES {
            PpuMode::VBlank
        } else if dot < 80 {
            PpuMode::OamScan
        } else if dot < 252 {
            PpuMode::Drawing
        } else {
            PpuMode::HBlank
        }
    }

    fn video(&self) -> VideoState {
        VideoState {
            ly: self.bus.read(memory::LY),
            lcdc: self.bus.read(memory::LCDC),
            stat: self.bus.read(memory::STAT),
            scy: self.bus.read(memory::SCY),
            scx: self.bus.read(memory::SCX),
            mode: self.mode(),
            frame: self.dots / (DOTS_PER_LINE * LINES_PER_FRAME),
        }
    }

    fn audio(&self) -> AudioState {
        let nr52 = self.bus.read(memory::NR52);
        AudioState {
            nr50: self.bus.read(memory::NR50),
            nr51: self.bus.read(memory::NR51),
            nr52,
            enabled: nr52 & 0x80 != 0,
        }
    }

    fn emit(&mut self) {
        let writes = self.bus.take_writes();
        self.sinks
            .emit(self.cpu.state(&self.bus), self.video(), self.audio(), writes);
    }

    fn enabled_breakpoint_at_pc(&self) -> Option<u16> {
        let pc = self.cpu.pc;
        (self.breakpoints.get(&pc).copied() == Some(true)).then_some(pc)
    }

    fn breakpoint_mut(&mut self, address: u16) -> Result<&mut bool, EmulatorError> {
        self.breakpoints
            .get_mut(&address)
            .ok_or(EmulatorError::BreakpointNotFound(address))
    }

    fn halt(&mut self, reason: HaltReason) {
        self.running = false;
        let _ = self.sinks.halted.send(RunHalted {
            reason,
            pc: self.cpu.pc,
        });
    }
}

fn mode_bits(mode: PpuMode) -> u8 {
    match mode {
        PpuMode::HBlank => 0,
        PpuMode::VBlank => 1,
        PpuMode::OamScan => 2,
        PpuMode::Drawing => 3,
    }
}

/// Low nibble of P1 for the selected button groups (active low).
fn p1_nibble(select: u8, pad: JoypadState) -> u8 {
    let mut pressed = 0u8;
    if select & 0x10 == 0 {
        pressed |= u8::from(pad.right)
            | u8::from(pad.left) << 1
            | u8::from(pad.up) << 2
            | u8::from(pad.down) << 3;
    }
    if select & 0x20 == 0 {
        pressed |= u8::from(pad.a)
            | u8::from(pad.b) << 1
            | u8::from(pad.select) << 2
            | u8::from(pad.start) << 3;
    }
    !pressed & 0x0F
}

/// The reference machine.
pub struct Machine {
    core: Arc<Mutex<Core>>,
    config: MachineConfig,
}

impl Machine {
    /// Build a powered-on machine with a blank cartridge.
    pub fn new(config: MachineConfig) -> (Self, StateStreams) {
        let (sinks, streams) = state_channels();
        let mut core = Core {
            cpu: Cpu::default(),
            bus: Bus::new(),
            rom: Vec::new(),
            dots: 0,
            breakpoints: BTreeMap::new(),
            slots: HashMap::new(),
            pending_joypad: None,
            running: false,
            run_epoch: 0,
            shut_down: false,
            sinks,
        };
        core.power_on();
        let machine = Self {
            core: Arc::new(Mutex::new(core)),
            config,
        };
        (machine, streams)
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.core.lock().running = false;
    }
}

/// Execute one tick's worth of instructions. Returns `false` once the loop
/// for `epoch` should end.
fn run_tick(core: &Mutex<Core>, epoch: u64, steps: u32, first: &mut bool) -> bool {
    let mut core = core.lock();
    for _ in 0..steps {
        if !core.running || core.run_epoch != epoch {
            return false;
        }
        // resuming from a breakpoint must get past it
        if !*first {
            if let Some(address) = core.enabled_breakpoint_at_pc() {
                debug!(address = format_args!("0x{address:04X}"), "breakpoint hit");
                core.halt(HaltReason::Breakpoint { address });
                return false;
            }
        }
        *first = false;
        core.execute();
    }
    true
}

impl Emulator for Machine {
    fn step(&self) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        core.execute();
        Ok(())
    }

    fn run(&self) -> Result<(), EmulatorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EmulatorError::Fault(format!("no async runtime: {e}")))?;
        let epoch = {
            let mut core = self.core.lock();
            core.alive()?;
            if core.running {
                return Ok(());
            }
            core.running = true;
            core.run_epoch += 1;
            core.run_epoch
        };

        let core = Arc::clone(&self.core);
        let tick = self.config.tick;
        let steps = self.config.steps_per_tick;
        drop(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut first = true;
            loop {
                let _ = interval.tick().await;
                if !run_tick(&core, epoch, steps, &mut first) {
                    break;
                }
            }
            debug!(epoch, "run loop ended");
        }));
        Ok(())
    }

    fn stop(&self) {
        let mut core = self.core.lock();
        if core.running {
            core.running = false;
            debug!(pc = core.cpu.pc, "run loop stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.core.lock().running
    }

    fn refresh(&self) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        core.apply_joypad();
        core.emit();
        Ok(())
    }

    fn reset(&self) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        core.running = false;
        core.power_on();
        Ok(())
    }

    fn load_rom(&self, rom: &RomSource) -> Result<(), EmulatorError> {
        let image = read_rom(&self.config.rom_dir, rom)?;
        let mut core = self.core.lock();
        core.alive()?;
        core.running = false;
        info!(bytes = image.len(), "rom loaded");
        core.rom = image;
        core.power_on();
        Ok(())
    }

    fn save_state(&self, slot: u8) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        let snapshot = Snapshot {
            cpu: core.cpu.clone(),
            memory: core.bus.snapshot(),
            dots: core.dots,
        };
        let _ = core.slots.insert(slot, snapshot);
        Ok(())
    }

    fn load_state(&self, slot: u8) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        let snapshot = core
            .slots
            .get(&slot)
            .cloned()
            .ok_or(EmulatorError::EmptySlot(slot))?;
        core.running = false;
        core.cpu = snapshot.cpu;
        core.bus.restore(&snapshot.memory);
        core.dots = snapshot.dots;
        Ok(())
    }

    fn add_breakpoint(&self, address: u16) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        let _ = core.breakpoints.insert(address, true);
        Ok(())
    }

    fn remove_breakpoint(&self, address: u16) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        core.breakpoints
            .remove(&address)
            .map(|_| ())
            .ok_or(EmulatorError::BreakpointNotFound(address))
    }

    fn enable_breakpoint(&self, address: u16) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        *core.breakpoint_mut(address)? = true;
        Ok(())
    }

    fn disable_breakpoint(&self, address: u16) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        *core.breakpoint_mut(address)? = false;
        Ok(())
    }

    fn enable_all_breakpoints(&self) {
        self.core
            .lock()
            .breakpoints
            .values_mut()
            .for_each(|enabled| *enabled = true);
    }

    fn disable_all_breakpoints(&self) {
        self.core
            .lock()
            .breakpoints
            .values_mut()
            .for_each(|enabled| *enabled = false);
    }

    fn breakpoints(&self) -> Vec<Breakpoint> {
        self.core
            .lock()
            .breakpoints
            .iter()
            .map(|(&address, &enabled)| Breakpoint { address, enabled })
            .collect()
    }

    fn attached_memories(&self) -> Vec<MemoryWrite> {
        self.core.lock().bus.attached()
    }

    fn submit_joypad(&self, state: JoypadState) -> Result<(), EmulatorError> {
        let mut core = self.core.lock();
        core.alive()?;
        core.pending_joypad = Some(state);
        Ok(())
    }

    fn shutdown(&self) {
        let mut core = self.core.lock();
        if !core.shut_down {
            core.running = false;
            core.shut_down = true;
            debug!("machine shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    /// `NOP; NOP; NOP; JR -5` at 0x0100: loops over 0x0100..=0x0103 forever.
    fn looping_rom() -> RomSource {
        let mut rom = vec![0u8; 0x0100];
        rom.extend_from_slice(&[0x00, 0x00, 0x00, 0x18, 0xFB]);
        RomSource::Bytes(rom)
    }

    fn machine() -> (Machine, StateStreams) {
        let (machine, streams) = Machine::new(MachineConfig {
            default_rom: None,
            tick: Duration::from_millis(1),
            steps_per_tick: 2,
            ..MachineConfig::default()
        });
        machine.load_rom(&looping_rom()).unwrap();
        (machine, streams)
    }

    #[tokio::test]
    async fn step_emits_once_per_stream() {
        let (machine, mut streams) = machine();
        machine.step().unwrap();
        assert_eq!(streams.processor.try_recv().unwrap().pc, 0x0101);
        assert!(streams.video.try_recv().is_ok());
        assert!(streams.audio.try_recv().unwrap().enabled);
        assert!(streams.memory.try_recv().is_ok());
        assert_eq!(streams.discard_pending(), 0);
    }

    #[test]
    fn breakpoint_lifecycle() {
        let (machine, _streams) = machine();
        machine.add_breakpoint(0x0150).unwrap();
        assert_eq!(
            machine.breakpoints(),
            vec![Breakpoint {
                address: 0x0150,
                enabled: true
            }]
        );
        machine.disable_breakpoint(0x0150).unwrap();
        assert!(!machine.breakpoints()[0].enabled);
        machine.enable_all_breakpoints();
        assert!(machine.breakpoints()[0].enabled);
        machine.remove_breakpoint(0x0150).unwrap();
        assert!(machine.breakpoints().is_empty());
        assert_matches!(
            machine.remove_breakpoint(0x0150),
            Err(EmulatorError::BreakpointNotFound(0x0150))
        );
        assert_matches!(
            machine.enable_breakpoint(0x0200),
            Err(EmulatorError::BreakpointNotFound(0x0200))
        );
    }

    #[tokio::test]
    async fn run_halts_on_enabled_breakpoint() {
        let (machine, mut streams) = machine();
        machine.add_breakpoint(0x0103).unwrap();
        machine.run().unwrap();
        let halted = tokio::time::timeout(Duration::from_secs(2), streams.halted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(halted.reason, HaltReason::Breakpoint { address: 0x0103 });
        assert_eq!(halted.pc, 0x0103);
        assert!(!machine.is_running());
    }

    #[tokio::test]
    async fn run_skips_disabled_breakpoint() {
        let (machine, mut streams) = machine();
        machine.add_breakpoint(0x0103).unwrap();
        machine.disable_all_breakpoints();
        machine.run().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        machine.stop();
        assert!(streams.halted.try_recv().is_err());
        assert!(streams.processor.try_recv().is_ok());
    }

    #[tokio::test]
    async fn nothing_emitted_after_stop_returns() {
        let (machine, mut streams) = machine();
        machine.run().unwrap();
        machine.run().unwrap();
        assert!(machine.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        machine.stop();
        assert!(!machine.is_running());
        assert!(streams.discard_pending() > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(streams.processor.try_recv().is_err());
        assert!(streams.halted.try_recv().is_err());
    }

    #[test]
    fn run_outside_runtime_is_a_fault() {
        let (machine, _streams) = Machine::new(MachineConfig::default());
        assert_matches!(machine.run(), Err(EmulatorError::Fault(_)));
        assert!(!machine.is_running());
    }

    #[tokio::test]
    async fn joypad_acknowledged_on_next_step() {
        let (machine, mut streams) = machine();
        let pad = JoypadState {
            start: true,
            ..JoypadState::default()
        };
        machine.submit_joypad(pad).unwrap();
        assert!(streams.input.try_recv().is_err());
        machine.step().unwrap();
        assert_eq!(streams.input.try_recv().unwrap(), pad);
        let writes = streams.memory.try_recv().unwrap();
        assert!(writes.iter().any(|w| w.address == memory::P1));
    }

    #[tokio::test]
    async fn save_and_load_state() {
        let (machine, mut streams) = machine();
        machine.save_state(1).unwrap();
        machine.step().unwrap();
        machine.step().unwrap();
        machine.load_state(1).unwrap();
        machine.refresh().unwrap();
        let _ = streams.processor.try_recv();
        let _ = streams.processor.try_recv();
        assert_eq!(streams.processor.try_recv().unwrap().pc, 0x0100);
        assert_matches!(machine.load_state(7), Err(EmulatorError::EmptySlot(7)));
    }

    #[tokio::test]
    async fn reset_returns_to_entry_point() {
        let (machine, mut streams) = machine();
        machine.step().unwrap();
        machine.reset().unwrap();
        machine.refresh().unwrap();
        let _ = streams.processor.try_recv();
        assert_eq!(streams.processor.try_recv().unwrap().pc, 0x0100);
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let (machine, _streams) = machine();
        machine.shutdown();
        machine.shutdown();
        assert_matches!(machine.step(), Err(EmulatorError::ShutDown));
        assert_matches!(machine.add_breakpoint(1), Err(EmulatorError::ShutDown));
    }

    #[test]
    fn p1_reflects_selected_group() {
        let pad = JoypadState {
            up: true,
            a: true,
            ..JoypadState::default()
        };
        assert_eq!(p1_nibble(0x20, pad), 0b1011);
        assert_eq!(p1_nibble(0x10, pad), 0b1110);
        assert_eq!(p1_nibble(0x30, pad), 0b1111);
    }
}
