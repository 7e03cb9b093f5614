//! Client connection handle and the single outbound writer.
//!
//! Exactly one task owns the socket sink. Everything else (the dispatcher,
//! the multiplexer, the lifecycle manager) enqueues encoded frames through
//! [`ClientConnection::send`], so frames for a connection are totally
//! ordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use dmg_core::{ConnectionId, Notification};
use futures::{Sink, SinkExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{NOTIFICATIONS_DROPPED_TOTAL, NOTIFICATIONS_SENT_TOTAL};

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Connection ID.
    pub id: ConnectionId,
    /// Queue into the writer task.
    tx: mpsc::Sender<String>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Notifications dropped because they failed to encode.
    dropped_notifications: AtomicU64,
    /// Set by the lifecycle manager: flush and close.
    closing: CancellationToken,
    /// Set by the writer when it exits for any reason.
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection around the writer's queue.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_notifications: AtomicU64::new(0),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Encode and enqueue a notification, waiting for queue space.
    ///
    /// Returns `false` only when the writer is gone. An encode failure drops
    /// the notification with a warning and still returns `true`.
    pub async fn send(&self, notification: &Notification) -> bool {
        let kind = notification.notification_type().name();
        let text = match notification.encode() {
            Ok(text) => text,
            Err(e) => {
                let _ = self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                warn!(connection_id = %self.id, kind, error = %e, "dropping notification");
                return true;
            }
        };
        if self.tx.send(text).await.is_err() {
            return false;
        }
        counter!(NOTIFICATIONS_SENT_TOTAL, "type" => kind).increment(1);
        true
    }

    /// Total notifications dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the writer to flush what is queued, send a close frame and exit.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Resolves once the writer has exited.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the writer has exited.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Heartbeat timing for the writer.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// Ping period.
    pub interval: Duration,
    /// Disconnect after this long without a pong.
    pub timeout: Duration,
}

/// Spawn the writer task that owns `sink`.
///
/// It forwards queued frames, pings on `heartbeat.interval`, and exits when
/// the client stops answering, a send fails, every sender is gone, or
/// [`ClientConnection::close`] is called (after flushing and sending a close
/// frame). On exit it marks the connection closed.
pub fn spawn_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<String>,
    conn: Arc<ClientConnection>,
    heartbeat: Heartbeat,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        debug!(connection_id = %conn.id, "socket send failed");
                        break;
                    }
                }
                () = conn.closing.cancelled() => {
                    while let Ok(text) = rx.try_recv() {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if !conn.check_alive() && conn.last_pong_elapsed() > heartbeat.timeout {
                        warn!(
                            connection_id = %conn.id,
                            "client unresponsive for {:?}, disconnecting",
                            heartbeat.timeout
                        );
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
        conn.closed.cancel();
    })
}
