//! Session - Per-identity state management
//!
//! Every protocol identity talking to the server has its own session that
//! tracks the selected database and the timing toggle. Sessions are created
//! lazily on the first request of an unseen identity and torn down through a
//! bounded removal queue the reactor drains once per cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::database_manager::Database;

/// Protocol-level identity frame; only used as a routing key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub Vec<u8>);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Session state for one identity
pub struct Session {
    pub id: SessionId,
    /// Database every command of this session runs against
    pub active_db: Arc<Database>,
    /// Log each batch with its execution time
    pub show_exec_time: bool,
}

impl Session {
    pub fn new(id: SessionId, active_db: Arc<Database>) -> Self {
        Self { id, active_db, show_exec_time: false }
    }

    pub fn select(&mut self, db: Arc<Database>) {
        self.active_db = db;
    }

    pub fn active_db_name(&self) -> &str {
        &self.active_db.name
    }

    /// Flip the timing toggle, returning the new value.
    pub fn toggle_exec_time(&mut self) -> bool {
        self.show_exec_time = !self.show_exec_time;
        self.show_exec_time
    }
}

/// Pending teardowns held before the reactor drains them
const REMOVAL_QUEUE_CAPACITY: usize = 1024;

/// All live sessions, keyed by identity
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    removal_tx: Sender<SessionId>,
    removal_rx: Receiver<SessionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        let (removal_tx, removal_rx) = bounded(REMOVAL_QUEUE_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            removal_tx,
            removal_rx,
        }
    }

    /// Session for `id`, created on `default_db` if the identity is new.
    pub fn resolve_or_create<F>(&self, id: &SessionId, default_db: F) -> Arc<Mutex<Session>>
    where
        F: FnOnce() -> Arc<Database>,
    {
        if let Some(session) = self.sessions.read().get(id) {
            return Arc::clone(session);
        }

        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session = %id, "new session");
            Arc::new(Mutex::new(Session::new(id.clone(), default_db())))
        }))
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(id).cloned()
    }

    /// Queue `id` for teardown at the next reactor cycle. A full queue
    /// removes the session immediately instead.
    pub fn schedule_removal(&self, id: SessionId) {
        match self.removal_tx.try_send(id) {
            Ok(()) => {}
            Err(TrySendError::Full(id)) | Err(TrySendError::Disconnected(id)) => {
                warn!(session = %id, "removal queue full, removing session now");
                self.sessions.write().remove(&id);
            }
        }
    }

    /// Apply all queued teardowns. Returns how many sessions were removed.
    pub fn drain_removals(&self) -> usize {
        let pending: Vec<SessionId> = self.removal_rx.try_iter().collect();
        if pending.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for id in pending {
            if sessions.remove(&id).is_some() {
                debug!(session = %id, "session removed");
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
