//! State fan-in: one task per run loop that waits on every state stream at
//! once and forwards whichever is ready to the connection's writer.
//!
//! Per-stream order is preserved; across streams, events go out in the order
//! this task happens to observe them.

use std::sync::Arc;

use dmg_core::state::RunHalted;
use dmg_core::{Notification, StateStreams};
use metrics::gauge;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;
use crate::metrics::RUN_LOOPS_ACTIVE;

/// Why the fan-in task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanInExit {
    /// Cancelled by the dispatcher.
    Cancelled,
    /// The emulator reported a halt.
    Halted,
    /// Every stream closed.
    Exhausted,
    /// The writer is gone.
    ConnectionClosed,
}

/// Handle to a running fan-in task. The task owns the streams and hands
/// them back when it ends.
pub struct Multiplexer {
    cancel: CancellationToken,
    task: JoinHandle<(StateStreams, FanInExit)>,
}

impl Multiplexer {
    /// Start forwarding `streams` to `conn`.
    pub fn spawn(streams: StateStreams, conn: Arc<ClientConnection>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        gauge!(RUN_LOOPS_ACTIVE).increment(1.0);
        let task = tokio::spawn(async move {
            let result = fan_in(streams, &conn, &token).await;
            gauge!(RUN_LOOPS_ACTIVE).decrement(1.0);
            result
        });
        Self { cancel, task }
    }

    /// Cancel the task, wait for it to flush what is queued, and take the
    /// streams back.
    pub async fn stop(self) -> Result<(StateStreams, FanInExit), JoinError> {
        self.cancel.cancel();
        self.task.await
    }

    /// Whether the task has already ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end on its own.
    pub async fn finished(&mut self) -> Result<(StateStreams, FanInExit), JoinError> {
        (&mut self.task).await
    }
}

#[derive(Clone, Copy, Debug)]
enum Stream {
    Processor,
    Video,
    Audio,
    Memory,
    Input,
    Halted,
}

#[derive(Clone, Copy, Debug)]
#[allow(clippy::struct_excessive_bools)]
struct Open {
    processor: bool,
    video: bool,
    audio: bool,
    memory: bool,
    input: bool,
    halted: bool,
}

impl Open {
    fn any(self) -> bool {
        self.processor || self.video || self.audio || self.memory || self.input || self.halted
    }

    fn close(&mut self, stream: Stream) {
        match stream {
            Stream::Processor => self.processor = false,
            Stream::Video => self.video = false,
            Stream::Audio => self.audio = false,
            Stream::Memory => self.memory = false,
            Stream::Input => self.input = false,
            Stream::Halted => self.halted = false,
        }
    }
}

enum Event {
    Cancelled,
    Halted(RunHalted),
    Notify(Notification),
    Ended(Stream),
}

fn notify<T>(stream: Stream, value: Option<T>, wrap: fn(T) -> Notification) -> Event {
    value.map_or(Event::Ended(stream), |v| Event::Notify(wrap(v)))
}

async fn fan_in(
    mut streams: StateStreams,
    conn: &ClientConnection,
    cancel: &CancellationToken,
) -> (StateStreams, FanInExit) {
    let mut open = Open {
        processor: true,
        video: true,
        audio: true,
        memory: true,
        input: true,
        halted: true,
    };

    loop {
        if !open.any() {
            return (streams, FanInExit::Exhausted);
        }
        let event = tokio::select! {
            () = cancel.cancelled() => Event::Cancelled,
            v = streams.halted.recv(), if open.halted => {
                v.map_or(Event::Ended(Stream::Halted), Event::Halted)
            }
            v = streams.processor.recv(), if open.processor => {
                notify(Stream::Processor, v, Notification::ProcessorState)
            }
            v = streams.video.recv(), if open.video => {
                notify(Stream::Video, v, Notification::VideoState)
            }
            v = streams.audio.recv(), if open.audio => {
                notify(Stream::Audio, v, Notification::AudioState)
            }
            v = streams.memory.recv(), if open.memory => {
                notify(Stream::Memory, v, Notification::MemoryWriteSet)
            }
            v = streams.input.recv(), if open.input => {
                notify(Stream::Input, v, Notification::JoypadState)
            }
        };

        match event {
            Event::Notify(notification) => {
                if !conn.send(&notification).await {
                    return (streams, FanInExit::ConnectionClosed);
                }
            }
            Event::Ended(stream) => {
                debug!(connection_id = %conn.id, ?stream, "state stream closed");
                open.close(stream);
            }
            Event::Cancelled => {
                // A halt queued before the stop is superseded by it.
                let superseded = streams.discard_halted();
                if superseded > 0 {
                    debug!(connection_id = %conn.id, superseded, "dropping halt raced by stop");
                }
                let exit = if flush(&mut streams, conn).await {
                    FanInExit::Cancelled
                } else {
                    FanInExit::ConnectionClosed
                };
                return (streams, exit);
            }
            Event::Halted(halted) => {
                debug!(connection_id = %conn.id, reason = ?halted.reason, pc = halted.pc, "run halted");
                if !flush(&mut streams, conn).await
                    || !conn.send(&Notification::RunHalted(halted)).await
                {
                    return (streams, FanInExit::ConnectionClosed);
                }
                return (streams, FanInExit::Halted);
            }
        }
    }
}

/// Forward everything already queued, one pass per stream. Returns `false`
/// if the writer went away.
pub(crate) async fn flush(streams: &mut StateStreams, conn: &ClientConnection) -> bool {
    let mut pending = Vec::new();
    while let Ok(v) = streams.processor.try_recv() {
        pending.push(Notification::ProcessorState(v));
    }
    while let Ok(v) = streams.video.try_recv() {
        pending.push(Notification::VideoState(v));
    }
    while let Ok(v) = streams.audio.try_recv() {
        pending.push(Notification::AudioState(v));
    }
    while let Ok(v) = streams.memory.try_recv() {
        pending.push(Notification::MemoryWriteSet(v));
    }
    while let Ok(v) = streams.input.try_recv() {
        pending.push(Notification::JoypadState(v));
    }
    for notification in &pending {
        if !conn.send(notification).await {
            return false;
        }
    }
    true
}
