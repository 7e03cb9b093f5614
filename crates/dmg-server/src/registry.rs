//! Live sessions by connection.
//!
//! The registry answers "which sessions are open" for health checks and
//! teardown. It never hands out emulator state; sessions read their own
//! streams. Shutdown reaches sessions through their cancellation tokens,
//! which are children of the server's shutdown token.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dmg_core::{ConnectionId, Emulator};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One registered session.
pub struct SessionEntry {
    /// Owning connection.
    pub id: ConnectionId,
    /// When the session was registered.
    pub connected_at: DateTime<Utc>,
    emulator: Arc<dyn Emulator>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl SessionEntry {
    /// Ask the session to close. Its dispatcher observes this and exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has an active run loop.
    pub fn is_running(&self) -> bool {
        self.emulator.is_running()
    }

    /// Shut the emulator down. Only the first call does anything; returns
    /// whether this call was it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.emulator.stop();
        self.emulator.shutdown();
        true
    }

    /// Whether the emulator has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Mutex-guarded map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `id`, replacing any stale entry.
    pub fn register(
        &self,
        id: ConnectionId,
        emulator: Arc<dyn Emulator>,
        cancel: CancellationToken,
    ) -> Arc<SessionEntry> {
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            connected_at: Utc::now(),
            emulator,
            cancel,
            released: AtomicBool::new(false),
        });
        let previous = self.sessions.lock().insert(id, Arc::clone(&entry));
        if let Some(stale) = previous {
            debug!(connection_id = %stale.id, "replaced stale session entry");
            stale.close();
        }
        entry
    }

    /// Remove the entry for `id`. Absent entries are fine.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().remove(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Sessions with an active run loop.
    pub fn running_count(&self) -> usize {
        // Clone out under the lock; emulators are never touched while holding it.
        let entries: Vec<_> = self.sessions.lock().values().cloned().collect();
        entries.iter().filter(|e| e.is_running()).count()
    }
}
