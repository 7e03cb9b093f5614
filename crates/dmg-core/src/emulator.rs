//! The contract a hosted emulator implements.
//!
//! The host never looks inside the emulator. It calls [`Emulator`]
//! operations and reads the resulting state events from [`StateStreams`].
//! Each stream preserves its own emission order; nothing is promised about
//! order *between* streams.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::errors::EmulatorError;
use crate::protocol::RomSource;
use crate::state::{
    AudioState, Breakpoint, JoypadState, MemoryWrite, ProcessorState, RunHalted, VideoState,
};

/// One emulator instance, exclusively owned by one session.
///
/// All methods take `&self`: the instance is shared between the session's
/// dispatcher and its background run loop, so implementations synchronize
/// internally.
pub trait Emulator: Send + Sync {
    /// Execute one instruction and emit one event on each state stream.
    ///
    /// Events for a step or refresh must be emitted before the next
    /// operation is called. The host drops anything still queued when it
    /// starts a new step, refresh or run.
    fn step(&self) -> Result<(), EmulatorError>;

    /// Start continuous execution in the background, emitting state events
    /// per instruction, until [`Emulator::stop`] or an enabled breakpoint.
    ///
    /// Calling `run` while already running is a no-op.
    fn run(&self) -> Result<(), EmulatorError>;

    /// Stop continuous execution. Returns once no further instruction will
    /// execute and no further events will be emitted by the run loop.
    fn stop(&self);

    /// Whether a run loop is active.
    fn is_running(&self) -> bool;

    /// Emit the current state on the processor, video, audio and memory
    /// streams without executing anything.
    fn refresh(&self) -> Result<(), EmulatorError>;

    /// Reset the machine to its power-on state, keeping the loaded ROM.
    fn reset(&self) -> Result<(), EmulatorError>;

    /// Load a ROM and reset.
    fn load_rom(&self, rom: &RomSource) -> Result<(), EmulatorError>;

    /// Save the machine state into `slot`.
    fn save_state(&self, slot: u8) -> Result<(), EmulatorError>;

    /// Restore the machine state from `slot`.
    fn load_state(&self, slot: u8) -> Result<(), EmulatorError>;

    /// Add an enabled breakpoint. Adding an existing address re-enables it.
    fn add_breakpoint(&self, address: u16) -> Result<(), EmulatorError>;

    /// Remove a breakpoint.
    fn remove_breakpoint(&self, address: u16) -> Result<(), EmulatorError>;

    /// Enable a breakpoint.
    fn enable_breakpoint(&self, address: u16) -> Result<(), EmulatorError>;

    /// Disable a breakpoint without removing it.
    fn disable_breakpoint(&self, address: u16) -> Result<(), EmulatorError>;

    /// Enable every breakpoint.
    fn enable_all_breakpoints(&self);

    /// Disable every breakpoint.
    fn disable_all_breakpoints(&self);

    /// Current breakpoints, sorted by address.
    fn breakpoints(&self) -> Vec<Breakpoint>;

    /// Named memory regions for the initial client sync.
    fn attached_memories(&self) -> Vec<MemoryWrite>;

    /// Queue button state. The emulator consumes it on its own schedule and
    /// acknowledges it on the input stream.
    fn submit_joypad(&self, state: JoypadState) -> Result<(), EmulatorError>;

    /// Release the instance. Idempotent; later operations fail with
    /// [`EmulatorError::ShutDown`].
    fn shutdown(&self);
}

/// A freshly created emulator together with its state streams.
pub struct EmulatorHandle {
    /// The instance.
    pub emulator: Arc<dyn Emulator>,
    /// Its state-event streams.
    pub streams: StateStreams,
}

impl std::fmt::Debug for EmulatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorHandle")
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

/// Creates one emulator per connection.
pub trait EmulatorFactory: Send + Sync {
    /// Build a new, independent instance.
    fn create(&self) -> Result<EmulatorHandle, EmulatorError>;
}

/// Receiving ends of an emulator's state-event streams.
#[derive(Debug)]
pub struct StateStreams {
    /// Processor registers, one per executed instruction.
    pub processor: UnboundedReceiver<ProcessorState>,
    /// Video registers.
    pub video: UnboundedReceiver<VideoState>,
    /// Audio registers.
    pub audio: UnboundedReceiver<AudioState>,
    /// Memory write deltas.
    pub memory: UnboundedReceiver<Vec<MemoryWrite>>,
    /// Joypad acknowledgements.
    pub input: UnboundedReceiver<JoypadState>,
    /// One event per run loop that ended without being stopped.
    pub halted: UnboundedReceiver<RunHalted>,
}

/// Sending ends matching [`StateStreams`], held by the emulator.
#[derive(Clone)]
pub struct StateSinks {
    /// Processor registers.
    pub processor: UnboundedSender<ProcessorState>,
    /// Video registers.
    pub video: UnboundedSender<VideoState>,
    /// Audio registers.
    pub audio: UnboundedSender<AudioState>,
    /// Memory write deltas.
    pub memory: UnboundedSender<Vec<MemoryWrite>>,
    /// Joypad acknowledgements.
    pub input: UnboundedSender<JoypadState>,
    /// Run-loop halts.
    pub halted: UnboundedSender<RunHalted>,
}

/// Create a connected set of sinks and streams.
pub fn state_channels() -> (StateSinks, StateStreams) {
    let (processor_tx, processor) = mpsc::unbounded_channel();
    let (video_tx, video) = mpsc::unbounded_channel();
    let (audio_tx, audio) = mpsc::unbounded_channel();
    let (memory_tx, memory) = mpsc::unbounded_channel();
    let (input_tx, input) = mpsc::unbounded_channel();
    let (halted_tx, halted) = mpsc::unbounded_channel();
    (
        StateSinks {
            processor: processor_tx,
            video: video_tx,
            audio: audio_tx,
            memory: memory_tx,
            input: input_tx,
            halted: halted_tx,
        },
        StateStreams {
            processor,
            video,
            audio,
            memory,
            input,
            halted,
        },
    )
}

impl StateSinks {
    /// Emit one event on each of the four state streams.
    ///
    /// Send failures mean the session is gone; they are ignored.
    pub fn emit(
        &self,
        processor: ProcessorState,
        video: VideoState,
        audio: AudioState,
        writes: Vec<MemoryWrite>,
    ) {
        let _ = self.processor.send(processor);
        let _ = self.video.send(video);
        let _ = self.audio.send(audio);
        let _ = self.memory.send(writes);
    }
}

impl StateStreams {
    /// Drop every queued event, returning how many were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.processor.try_recv().is_ok() {
            dropped += 1;
        }
        while self.video.try_recv().is_ok() {
            dropped += 1;
        }
        while self.audio.try_recv().is_ok() {
            dropped += 1;
        }
        while self.memory.try_recv().is_ok() {
            dropped += 1;
        }
        dropped + self.discard_halted()
    }

    /// Drop queued halt events, returning how many were discarded.
    pub fn discard_halted(&mut self) -> usize {
        let mut dropped = 0;
        while self.halted.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
