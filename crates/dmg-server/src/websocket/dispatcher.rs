//! Command dispatcher: reads decoded commands for one connection and drives
//! its emulator through `idle`, `stepping`, `running` and `closed`.
//!
//! While idle the dispatcher owns the state streams and drains them itself
//! after a step or refresh. While running it lends them to a
//! [`Multiplexer`] and gets them back when the run loop ends, whether it was
//! stopped or ended on its own.
//!
//! A step drain keeps reading the inbound side so a client close cuts it
//! short. Commands that arrive meanwhile are queued and dispatched after it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dmg_core::{Command, CommandType, Emulator, EmulatorError, Notification, StateStreams};
use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinError;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::connection::ClientConnection;
use super::multiplexer::{FanInExit, Multiplexer};
use crate::metrics::{
    COMMAND_ERRORS_TOTAL, COMMANDS_TOTAL, DECODE_ERRORS_TOTAL, STEP_DRAIN_TIMEOUTS_TOTAL,
};

/// One inbound frame, already stripped of transport details.
#[derive(Debug)]
pub enum Frame {
    /// A text payload (text frames and UTF-8 binary frames).
    Text(String),
    /// The client sent a close frame.
    Close,
    /// The transport failed.
    Error(String),
    /// A binary frame that is not UTF-8.
    Invalid,
}

/// Why a connection's session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame from the client.
    ClientClosed,
    /// The inbound stream ended.
    Eof,
    /// Read error on the socket.
    TransportError,
    /// A frame failed to decode.
    MalformedCommand,
    /// The writer exited (send failure or heartbeat timeout).
    WriterClosed,
    /// Server shutdown or registry close.
    Shutdown,
    /// The emulator factory failed.
    FactoryFailed,
    /// A session task panicked.
    Internal,
}

impl CloseReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Eof => "eof",
            Self::TransportError => "transport_error",
            Self::MalformedCommand => "malformed_command",
            Self::WriterClosed => "writer_closed",
            Self::Shutdown => "shutdown",
            Self::FactoryFailed => "factory_failed",
            Self::Internal => "internal",
        }
    }
}

/// Dispatcher state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for commands; the dispatcher holds the streams.
    Idle,
    /// Draining one burst of state after a step or refresh.
    Stepping,
    /// A run loop is active and the multiplexer holds the streams.
    Running,
    /// Terminal.
    Closed,
}

enum Flow {
    Continue,
    Close(CloseReason),
}

enum Input {
    Frame(Option<Frame>),
    RunEnded(Result<(StateStreams, FanInExit), JoinError>),
    Close(CloseReason),
}

enum Drain {
    Interrupted(CloseReason),
    TimedOut,
    StreamClosed,
}

/// Per-connection command state machine.
pub struct Dispatcher {
    conn: Arc<ClientConnection>,
    emulator: Arc<dyn Emulator>,
    streams: Option<StateStreams>,
    mux: Option<Multiplexer>,
    backlog: VecDeque<Frame>,
    state: SessionState,
    cancel: CancellationToken,
    step_timeout: Duration,
}

impl Dispatcher {
    /// Create an idle dispatcher.
    pub fn new(
        conn: Arc<ClientConnection>,
        emulator: Arc<dyn Emulator>,
        streams: StateStreams,
        cancel: CancellationToken,
        step_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            emulator,
            streams: Some(streams),
            mux: None,
            backlog: VecDeque::new(),
            state: SessionState::Idle,
            cancel,
            step_timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Execute one instruction and forward the resulting burst.
    ///
    /// Used for the initial burst on connect. `frames` is watched for a close
    /// while the burst drains. Returns a reason only when the session must
    /// end.
    pub async fn step_burst<S>(&mut self, frames: &mut S) -> Option<CloseReason>
    where
        S: Stream<Item = Frame> + Unpin,
    {
        match self.step(frames).await {
            Flow::Continue => None,
            Flow::Close(reason) => Some(reason),
        }
    }

    /// Read and dispatch frames until the session ends.
    pub async fn run<S>(&mut self, mut frames: S) -> CloseReason
    where
        S: Stream<Item = Frame> + Unpin,
    {
        loop {
            let input = match self.backlog.pop_front() {
                Some(frame) => Input::Frame(Some(frame)),
                None => tokio::select! {
                    frame = frames.next() => Input::Frame(frame),
                    ended = wait_mux(&mut self.mux), if self.mux.is_some() => Input::RunEnded(ended),
                    () = self.cancel.cancelled() => Input::Close(CloseReason::Shutdown),
                    () = self.conn.closed() => Input::Close(CloseReason::WriterClosed),
                },
            };

            let flow = match input {
                Input::Frame(None) => Flow::Close(CloseReason::Eof),
                Input::Frame(Some(frame)) => self.on_frame(frame, &mut frames).await,
                Input::RunEnded(ended) => {
                    self.mux = None;
                    self.run_ended(ended)
                }
                Input::Close(reason) => Flow::Close(reason),
            };

            if let Flow::Close(reason) = flow {
                self.state = SessionState::Closed;
                return reason;
            }
        }
    }

    /// Stop any active run and mark the dispatcher closed. Safe to call
    /// more than once.
    pub async fn finish(&mut self) {
        let _ = self.stop_run().await;
        self.state = SessionState::Closed;
    }

    async fn on_frame<S>(&mut self, frame: Frame, frames: &mut S) -> Flow
    where
        S: Stream<Item = Frame> + Unpin,
    {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Close => return Flow::Close(CloseReason::ClientClosed),
            Frame::Error(e) => {
                debug!(connection_id = %self.conn.id, error = %e, "socket read failed");
                return Flow::Close(CloseReason::TransportError);
            }
            Frame::Invalid => {
                counter!(DECODE_ERRORS_TOTAL).increment(1);
                warn!(connection_id = %self.conn.id, "non-UTF-8 binary frame");
                return Flow::Close(CloseReason::MalformedCommand);
            }
        };

        match Command::decode(&text) {
            Ok(command) => {
                if let Flow::Close(reason) = self.reap().await {
                    return Flow::Close(reason);
                }
                self.dispatch(command, frames).await
            }
            Err(e) => {
                counter!(DECODE_ERRORS_TOTAL).increment(1);
                warn!(connection_id = %self.conn.id, error = %e, "malformed command");
                Flow::Close(CloseReason::MalformedCommand)
            }
        }
    }

    async fn dispatch<S>(&mut self, command: Command, frames: &mut S) -> Flow
    where
        S: Stream<Item = Frame> + Unpin,
    {
        let kind = command.command_type();
        counter!(COMMANDS_TOTAL, "command" => kind.name()).increment(1);
        debug!(
            connection_id = %self.conn.id,
            command = kind.name(),
            state = ?self.state,
            "dispatching command"
        );

        let result = match command {
            Command::Connect => Ok(()),
            Command::Step => return self.step(frames).await,
            Command::Run => self.start_run(),
            Command::Stop => return self.stop_run().await,
            Command::Reset => return self.then_refresh(kind, frames, |e| e.reset()).await,
            Command::LoadRom(rom) => {
                return self.then_refresh(kind, frames, |e| e.load_rom(&rom)).await;
            }
            Command::LoadState { slot } => {
                return self.then_refresh(kind, frames, |e| e.load_state(slot)).await;
            }
            Command::SaveState { slot } => self.emulator.save_state(slot),
            Command::JoypadInput(pad) => self.emulator.submit_joypad(pad),
            Command::AddBreakpoint(address) => self.emulator.add_breakpoint(address),
            Command::RemoveBreakpoint(address) => self.emulator.remove_breakpoint(address),
            Command::EnableBreakpoint(address) => self.emulator.enable_breakpoint(address),
            Command::DisableBreakpoint(address) => self.emulator.disable_breakpoint(address),
            Command::EnableAllBreakpoints => {
                self.emulator.enable_all_breakpoints();
                Ok(())
            }
            Command::DisableAllBreakpoints => {
                self.emulator.disable_all_breakpoints();
                Ok(())
            }
        };
        self.report(kind, result).await
    }

    async fn step<S>(&mut self, frames: &mut S) -> Flow
    where
        S: Stream<Item = Frame> + Unpin,
    {
        if self.state == SessionState::Running {
            counter!(COMMAND_ERRORS_TOTAL, "command" => CommandType::Step.name()).increment(1);
            return self
                .notify(Notification::error("cannot step while running"))
                .await;
        }
        self.discard_stale();
        if let Err(e) = self.emulator.step() {
            return self.report(CommandType::Step, Err(e)).await;
        }
        self.drain(frames).await
    }

    fn start_run(&mut self) -> Result<(), EmulatorError> {
        if self.state == SessionState::Running {
            debug!(connection_id = %self.conn.id, "run ignored, already running");
            return Ok(());
        }
        self.discard_stale();
        let Some(streams) = self.streams.take() else {
            return Err(EmulatorError::Fault("state streams unavailable".into()));
        };
        if let Err(e) = self.emulator.run() {
            self.streams = Some(streams);
            return Err(e);
        }
        self.mux = Some(Multiplexer::spawn(streams, Arc::clone(&self.conn)));
        self.state = SessionState::Running;
        Ok(())
    }

    async fn stop_run(&mut self) -> Flow {
        let Some(mux) = self.mux.take() else {
            return Flow::Continue;
        };
        self.emulator.stop();
        let ended = mux.stop().await;
        self.run_ended(ended)
    }

    // A run that ended on its own may not have been observed by the read
    // loop yet.
    async fn reap(&mut self) -> Flow {
        if !self.mux.as_ref().is_some_and(Multiplexer::is_finished) {
            return Flow::Continue;
        }
        match self.mux.take() {
            Some(mux) => {
                let ended = mux.stop().await;
                self.run_ended(ended)
            }
            None => Flow::Continue,
        }
    }

    fn run_ended(&mut self, ended: Result<(StateStreams, FanInExit), JoinError>) -> Flow {
        self.state = SessionState::Idle;
        match ended {
            Ok((streams, exit)) => {
                self.streams = Some(streams);
                debug!(connection_id = %self.conn.id, ?exit, "run loop ended");
                match exit {
                    FanInExit::ConnectionClosed => Flow::Close(CloseReason::WriterClosed),
                    FanInExit::Exhausted => {
                        self.emulator.stop();
                        Flow::Continue
                    }
                    FanInExit::Cancelled | FanInExit::Halted => Flow::Continue,
                }
            }
            Err(e) => {
                error!(connection_id = %self.conn.id, error = %e, "multiplexer task failed");
                self.emulator.stop();
                Flow::Close(CloseReason::Internal)
            }
        }
    }

    async fn then_refresh<S, F>(&mut self, kind: CommandType, frames: &mut S, op: F) -> Flow
    where
        S: Stream<Item = Frame> + Unpin,
        F: FnOnce(&dyn Emulator) -> Result<(), EmulatorError>,
    {
        if let Flow::Close(reason) = self.stop_run().await {
            return Flow::Close(reason);
        }
        self.discard_stale();
        let result = op(self.emulator.as_ref()).and_then(|()| self.emulator.refresh());
        if result.is_err() {
            return self.report(kind, result).await;
        }
        self.drain(frames).await
    }

    // Anything queued while idle belongs to an earlier operation.
    fn discard_stale(&mut self) {
        if let Some(streams) = self.streams.as_mut() {
            let stale = streams.discard_pending();
            if stale > 0 {
                debug!(connection_id = %self.conn.id, stale, "dropping late state events");
            }
        }
    }

    async fn drain<S>(&mut self, frames: &mut S) -> Flow
    where
        S: Stream<Item = Frame> + Unpin,
    {
        let Some(streams) = self.streams.as_mut() else {
            return Flow::Continue;
        };
        self.state = SessionState::Stepping;
        let mut burst = Burst {
            conn: &self.conn,
            cancel: &self.cancel,
            frames,
            backlog: &mut self.backlog,
            deadline: Instant::now() + self.step_timeout,
        };
        let outcome = burst.drain(streams).await;
        self.state = SessionState::Idle;

        let message = match outcome {
            Ok(()) => return Flow::Continue,
            Err(Drain::Interrupted(reason)) => return Flow::Close(reason),
            Err(Drain::TimedOut) => {
                counter!(STEP_DRAIN_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    connection_id = %self.conn.id,
                    timeout_ms = u64::try_from(self.step_timeout.as_millis()).unwrap_or(u64::MAX),
                    "step drain timed out"
                );
                "timed out waiting for emulator state"
            }
            Err(Drain::StreamClosed) => {
                warn!(connection_id = %self.conn.id, "state stream closed during drain");
                "emulator state stream closed"
            }
        };
        let _ = streams.discard_pending();
        self.notify(Notification::error(message)).await
    }

    async fn report(&self, kind: CommandType, result: Result<(), EmulatorError>) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(e) => {
                counter!(COMMAND_ERRORS_TOTAL, "command" => kind.name()).increment(1);
                debug!(connection_id = %self.conn.id, command = kind.name(), error = %e, "command failed");
                self.notify(Notification::error(e)).await
            }
        }
    }

    async fn notify(&self, notification: Notification) -> Flow {
        if self.conn.send(&notification).await {
            Flow::Continue
        } else {
            Flow::Close(CloseReason::WriterClosed)
        }
    }
}

async fn wait_mux(
    mux: &mut Option<Multiplexer>,
) -> Result<(StateStreams, FanInExit), JoinError> {
    match mux {
        Some(mux) => mux.finished().await,
        None => std::future::pending().await,
    }
}

/// Everything a step drain watches besides the state streams.
struct Burst<'a, S> {
    conn: &'a ClientConnection,
    cancel: &'a CancellationToken,
    frames: &'a mut S,
    backlog: &'a mut VecDeque<Frame>,
    deadline: Instant,
}

impl<S> Burst<'_, S>
where
    S: Stream<Item = Frame> + Unpin,
{
    /// Forward one event from each state stream, processor first, then any
    /// joypad acknowledgements already queued.
    async fn drain(&mut self, streams: &mut StateStreams) -> Result<(), Drain> {
        let processor = self.next(&mut streams.processor).await?;
        self.forward(Notification::ProcessorState(processor)).await?;
        let video = self.next(&mut streams.video).await?;
        self.forward(Notification::VideoState(video)).await?;
        let audio = self.next(&mut streams.audio).await?;
        self.forward(Notification::AudioState(audio)).await?;
        let writes = self.next(&mut streams.memory).await?;
        self.forward(Notification::MemoryWriteSet(writes)).await?;

        while let Ok(ack) = streams.input.try_recv() {
            self.forward(Notification::JoypadState(ack)).await?;
        }
        Ok(())
    }

    async fn next<T>(&mut self, rx: &mut UnboundedReceiver<T>) -> Result<T, Drain> {
        loop {
            let frame = tokio::select! {
                biased;
                received = timeout_at(self.deadline, rx.recv()) => {
                    return match received {
                        Ok(Some(value)) => Ok(value),
                        Ok(None) => Err(Drain::StreamClosed),
                        Err(_) => Err(Drain::TimedOut),
                    };
                }
                () = self.conn.closed() => return Err(Drain::Interrupted(CloseReason::WriterClosed)),
                () = self.cancel.cancelled() => return Err(Drain::Interrupted(CloseReason::Shutdown)),
                frame = self.frames.next() => frame,
            };
            match frame {
                None => return Err(Drain::Interrupted(CloseReason::Eof)),
                Some(Frame::Close) => return Err(Drain::Interrupted(CloseReason::ClientClosed)),
                Some(Frame::Error(e)) => {
                    debug!(connection_id = %self.conn.id, error = %e, "socket read failed");
                    return Err(Drain::Interrupted(CloseReason::TransportError));
                }
                Some(frame) => self.backlog.push_back(frame),
            }
        }
    }

    async fn forward(&self, notification: Notification) -> Result<(), Drain> {
        if self.conn.send(&notification).await {
            Ok(())
        } else {
            Err(Drain::Interrupted(CloseReason::WriterClosed))
        }
    }
}
