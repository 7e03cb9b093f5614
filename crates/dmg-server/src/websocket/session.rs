//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dmg_core::{ConnectionId, Emulator, EmulatorFactory, EmulatorHandle, Notification};
use futures::stream::SplitStream;
use futures::{StreamExt, future};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::connection::{ClientConnection, Heartbeat, spawn_writer};
use super::dispatcher::{CloseReason, Dispatcher, Frame};
use crate::config::ServerConfig;
use crate::metrics::{
    SESSION_CREATE_FAILURES_TOTAL, SESSIONS_ACTIVE, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::registry::{SessionEntry, SessionRegistry};

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a WebSocket session for a connected client.
///
/// 1. Spawns the writer that owns the socket sink
/// 2. Creates and registers an emulator
/// 3. Sends the attached memory maps and an initial step burst
/// 4. Dispatches inbound commands until the connection ends
/// 5. Stops the run loop, flushes and closes the transport, then releases
///    the emulator and deregisters
#[instrument(skip_all, fields(connection_id = %id))]
pub async fn run_session(
    ws: WebSocket,
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn EmulatorFactory>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (ws_tx, ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<String>(config.outbound_queue.max(1));
    let conn = Arc::new(ClientConnection::new(id, send_tx));
    let mut writer = spawn_writer(
        ws_tx,
        send_rx,
        Arc::clone(&conn),
        Heartbeat {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
        },
    );

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (reason, guard) = match factory.create() {
        Ok(EmulatorHandle { emulator, streams }) => {
            let cancel = shutdown.child_token();
            let guard = SessionGuard::new(
                &registry,
                registry.register(conn.id.clone(), Arc::clone(&emulator), cancel.clone()),
            );
            let dispatcher = Dispatcher::new(
                Arc::clone(&conn),
                Arc::clone(&emulator),
                streams,
                cancel,
                config.step_timeout(),
            );
            let reason = serve(dispatcher, emulator.as_ref(), &conn, ws_rx).await;
            (reason, Some(guard))
        }
        Err(e) => {
            counter!(SESSION_CREATE_FAILURES_TOTAL).increment(1);
            warn!(error = %e, "failed to create emulator");
            let _ = conn
                .send(&Notification::error(format!("failed to create emulator: {e}")))
                .await;
            (CloseReason::FactoryFailed, None)
        }
    };

    teardown(&conn, &mut writer, guard).await;

    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(
        reason = reason.as_str(),
        dropped_notifications = conn.drop_count(),
        "client disconnected"
    );
}

async fn serve(
    mut dispatcher: Dispatcher,
    emulator: &dyn Emulator,
    conn: &Arc<ClientConnection>,
    ws_rx: SplitStream<WebSocket>,
) -> CloseReason {
    let reader = Arc::clone(conn);
    let mut frames = ws_rx.filter_map(move |msg| future::ready(inbound_frame(msg, &reader)));

    let maps = Notification::InitialMemoryMaps(emulator.attached_memories());
    let reason = if !conn.send(&maps).await {
        CloseReason::WriterClosed
    } else if let Some(reason) = dispatcher.step_burst(&mut frames).await {
        reason
    } else {
        dispatcher.run(frames).await
    };

    dispatcher.finish().await;
    reason
}

/// Close the transport, then drop the session. The registry entry outlives
/// the open socket, never the other way round.
async fn teardown(
    conn: &ClientConnection,
    writer: &mut JoinHandle<()>,
    guard: Option<SessionGuard<'_>>,
) {
    conn.close();
    if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut *writer)
        .await
        .is_err()
    {
        warn!("writer did not finish flushing, aborting");
        writer.abort();
    }
    drop(guard);
}

/// Map a transport message to a dispatcher frame. Control frames count as
/// liveness and are not forwarded.
fn inbound_frame(msg: Result<Message, axum::Error>, conn: &ClientConnection) -> Option<Frame> {
    let msg = match msg {
        Ok(msg) => msg,
        Err(e) => return Some(Frame::Error(e.to_string())),
    };
    conn.mark_alive();
    match msg {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(
            std::str::from_utf8(&data).map_or(Frame::Invalid, |text| Frame::Text(text.to_owned())),
        ),
        Message::Close(_) => Some(Frame::Close),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

/// Releases the emulator and deregisters the session exactly once, on
/// every exit path.
struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    entry: Arc<SessionEntry>,
}

impl<'a> SessionGuard<'a> {
    fn new(registry: &'a SessionRegistry, entry: Arc<SessionEntry>) -> Self {
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        Self { registry, entry }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let _ = self.entry.release();
        let _ = self.registry.remove(&self.entry.id);
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use dmg_machine::{Machine, MachineConfig};

    use super::*;

    fn connection() -> (ClientConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(4);
        (ClientConnection::new(ConnectionId::from("conn_frames"), tx), rx)
    }

    #[test]
    fn text_and_utf8_binary_become_text() {
        let (conn, _rx) = connection();
        assert!(matches!(
            inbound_frame(Ok(Message::Text(r#"{"type":10}"#.into())), &conn),
            Some(Frame::Text(t)) if t == r#"{"type":10}"#
        ));
        assert!(matches!(
            inbound_frame(Ok(Message::Binary(br#"{"type":11}"#.to_vec().into())), &conn),
            Some(Frame::Text(t)) if t == r#"{"type":11}"#
        ));
    }

    #[test]
    fn non_utf8_binary_is_invalid() {
        let (conn, _rx) = connection();
        assert!(matches!(
            inbound_frame(Ok(Message::Binary(vec![0xff, 0xfe].into())), &conn),
            Some(Frame::Invalid)
        ));
    }

    #[test]
    fn control_frames_mark_alive_and_are_filtered() {
        let (conn, _rx) = connection();
        let _ = conn.check_alive();
        assert!(inbound_frame(Ok(Message::Pong(Vec::new().into())), &conn).is_none());
        assert!(conn.check_alive());
        assert!(inbound_frame(Ok(Message::Ping(Vec::new().into())), &conn).is_none());
    }

    #[test]
    fn close_and_errors_map_through() {
        let (conn, _rx) = connection();
        assert!(matches!(
            inbound_frame(Ok(Message::Close(None)), &conn),
            Some(Frame::Close)
        ));
        let err = axum::Error::new(std::io::Error::other("reset"));
        assert!(matches!(inbound_frame(Err(err), &conn), Some(Frame::Error(_))));
    }

    #[test]
    fn guard_releases_and_deregisters_once() {
        let registry = SessionRegistry::new();
        let (machine, _streams) = Machine::new(MachineConfig::default());
        let machine = Arc::new(machine);
        let id = ConnectionId::from("conn_guard");
        let entry = registry.register(id.clone(), machine.clone(), CancellationToken::new());
        {
            let _guard = SessionGuard::new(&registry, Arc::clone(&entry));
            assert!(registry.contains(&id));
        }
        assert!(!registry.contains(&id));
        assert!(entry.is_released());
        assert!(!entry.release());
        assert!(machine.step().is_err());
    }

    #[tokio::test]
    async fn session_stays_registered_until_the_writer_is_done() {
        let registry = SessionRegistry::new();
        let (machine, _streams) = Machine::new(MachineConfig::default());
        let (conn, _rx) = connection();
        let entry = registry.register(conn.id.clone(), Arc::new(machine), CancellationToken::new());
        let guard = SessionGuard::new(&registry, entry);

        let (flushed_tx, flushed_rx) = tokio::sync::oneshot::channel::<()>();
        let mut writer = tokio::spawn(async move {
            let _ = flushed_rx.await;
        });

        let closing = teardown(&conn, &mut writer, Some(guard));
        tokio::pin!(closing);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut closing)
                .await
                .is_err()
        );
        assert!(registry.contains(&conn.id));

        flushed_tx.send(()).unwrap();
        closing.await;
        assert!(!registry.contains(&conn.id));
    }
}
