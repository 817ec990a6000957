//! Server - the object graph behind one tris instance
//!
//! Owns the configuration, database registry, session table, command
//! registry and counters, plus the lifecycle state the reactor watches.
//!
//! # Lifecycle
//!
//! ```text
//! RUNNING --stop()/SHUTDOWN--> STOP --reactor drains + persists--> STOPPED
//! ```
//!
//! `stop()` only records the request; the reactor notices it on its next
//! state check, waits for running requests, persists every database and
//! closes the transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::command::{self, AccessFlags, CommandRegistry};
use crate::config::ServerConfig;
use crate::database_manager::{Database, DatabaseManager, LoadReport};
use crate::error::{Result, TrisError};
use crate::metrics::Metrics;
use crate::protocol::{parse_request, CommandLine, Reply};
use crate::reactor;
use crate::session::{Session, SessionId, SessionTable};
use crate::transport::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Running = 0,
    Stop = 1,
    Stopped = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::Stop,
            _ => ServerState::Stopped,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    databases: DatabaseManager,
    sessions: SessionTable,
    metrics: Metrics,
    commands: CommandRegistry,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            databases: DatabaseManager::from_config(&config),
            sessions: SessionTable::new(),
            metrics: Metrics::new(),
            commands: CommandRegistry::builtin()?,
            state: AtomicU8::new(ServerState::Running as u8),
            local_addr: Mutex::new(None),
            config,
        })
    }

    /// Load every database found in the data directory.
    pub fn initialize(&self) -> Result<LoadReport> {
        let report = self.databases.load_all()?;
        info!(
            data_dir = %self.config.data_dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "databases loaded"
        );
        Ok(report)
    }

    /// Bind the transport and spawn the reactor.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let router = Router::bind(&self.config.endpoint()).await?;
        let addr = router.local_addr();
        *self.local_addr.lock() = Some(addr);
        info!(endpoint = %self.config.endpoint(), %addr, "server listening");
        Ok(tokio::spawn(reactor::run(Arc::clone(self), router)))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn databases(&self) -> &DatabaseManager {
        &self.databases
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Address the transport is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        let requested = self.state.compare_exchange(
            ServerState::Running as u8,
            ServerState::Stop as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if requested.is_ok() {
            info!("stop requested");
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
    }

    /// Resolve once the reactor finished its shutdown.
    pub async fn wait_stopped(&self) {
        while self.state() != ServerState::Stopped {
            tokio::time::sleep(self.config.stop_poll_interval()).await;
        }
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    fn default_database(&self) -> Arc<Database> {
        self.databases.ensure_default()
    }

    /// Execute every command line of `body` for `identity` and return the
    /// encoded reply body, one frame per line joined by `\n`.
    pub fn handle_request(&self, identity: &SessionId, body: &[u8]) -> Vec<u8> {
        let started = Instant::now();
        let session = self.sessions.resolve_or_create(identity, || self.default_database());
        let mut session = session.lock();

        let lines = parse_request(body);
        let mut encoded = Vec::new();
        for (n, line) in lines.iter().enumerate() {
            if n > 0 {
                encoded.push(b'\n');
            }
            encoded.extend_from_slice(&self.execute_line(&mut session, line));
        }

        if session.show_exec_time {
            let batch: Vec<String> = lines.iter().map(CommandLine::render).collect();
            info!(
                session = %identity,
                db = session.active_db_name(),
                commands = ?batch,
                elapsed_us = started.elapsed().as_micros() as u64,
                "request executed"
            );
        }
        encoded
    }

    /// Run one line and return its encoded frame. A write is counted only
    /// once its OK reply made it onto the wire.
    fn execute_line(&self, session: &mut Session, line: &CommandLine) -> Vec<u8> {
        let started = Instant::now();
        let (reply, writes) = match self.commands.get(&line.name) {
            None => (Reply::fail(TrisError::UnknownCommand(line.name.clone()).to_string()), false),
            Some(command) => (
                command::invoke(command.as_ref(), self, session, &line.args),
                command.flags().contains(AccessFlags::WRITE),
            ),
        };

        let (frame, ok) = encode_reply(&reply);
        if ok && writes {
            self.account_write(&session.active_db);
        }

        self.metrics.record_command(&line.name, ok, started.elapsed());
        debug!(session = %session.id, command = %line.render(), ok, "command executed");
        frame
    }

    /// Count one write and persist once the ops threshold is reached.
    fn account_write(&self, db: &Database) {
        db.record_write();
        if !db.ops_limit_reached() {
            return;
        }
        match db.persist(false) {
            Ok(true) => debug!(db = %db.name, ops = db.ops_count(), "ops limit reached, persisted"),
            Ok(false) => {}
            Err(e) => error!(db = %db.name, error = %e, "persist after ops limit failed"),
        }
    }
}

/// Encode `reply`, falling back to a FAIL reply carrying the encoding error.
/// Returns the frame and whether it reports success.
fn encode_reply(reply: &Reply) -> (Vec<u8>, bool) {
    match reply.encode() {
        Ok(frame) => (frame, reply.is_ok()),
        Err(e) => {
            error!(error = %e, "reply encoding failed");
            let fallback = Reply::fail(format!("Could not encode reply: {}", e));
            (fallback.encode().unwrap_or_default(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_batch, Field, FieldType};
    use tempfile::{tempdir, TempDir};

    fn make_server() -> (TempDir, Server) {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            persist_ops_limit: 0,
            ..ServerConfig::default()
        };
        let server = Server::new(config).unwrap();
        server.initialize().unwrap();
        (dir, server)
    }

    fn run(server: &Server, id: &[u8], body: &str) -> Vec<Reply> {
        let expected = parse_request(body.as_bytes()).len();
        let bytes = server.handle_request(&SessionId(id.to_vec()), body.as_bytes());
        decode_batch(&bytes, expected).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ServerConfig { protocol: "udp".into(), ..ServerConfig::default() };
        assert!(matches!(Server::new(config), Err(TrisError::InvalidConfig(_))));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_dir, server) = make_server();
        assert!(server.is_running());
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stop);
        server.mark_stopped();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_unknown_command_does_not_abort_batch() {
        let (_dir, server) = make_server();
        let replies = run(&server, b"c", "BOGUS\nPING");

        assert_eq!(replies.len(), 2);
        assert!(!replies[0].is_ok());
        assert_eq!(replies[0].first(), Some(&Field::text("Unknown Command BOGUS.")));
        assert_eq!(replies[1].first(), Some(&Field::text("heartbeat")));
        assert_eq!(server.metrics().commands_processed(), 2);
    }

    #[test]
    fn test_missing_argument_is_a_fail_reply() {
        let (_dir, server) = make_server();
        let replies = run(&server, b"c", "ADD");
        assert!(!replies[0].is_ok());
        assert_eq!(replies[0].signature, vec![FieldType::String]);
        assert_eq!(server.default_database().ops_count(), 0);
    }

    #[test]
    fn test_empty_body_gives_empty_reply() {
        let (_dir, server) = make_server();
        assert!(server.handle_request(&SessionId(b"c".to_vec()), b"\n\n").is_empty());
    }

    #[test]
    fn test_writes_are_counted_on_active_db() {
        let (_dir, server) = make_server();
        run(&server, b"c", "ADD a\nADD a\nDEL a\nDEL missing\nHAS a\nMEMBERS");
        assert_eq!(server.default_database().ops_count(), 4);
    }

    #[test]
    fn test_ops_limit_triggers_persist() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            persist_ops_limit: 2,
            ..ServerConfig::default()
        };
        let server = Server::new(config).unwrap();
        server.initialize().unwrap();

        run(&server, b"c", "CREATE w\nSELECT w\nADD x");
        let db = server.databases().get_database("w").unwrap();
        assert_eq!(db.last_persist_ops_count(), 0);

        run(&server, b"c", "ADD y");
        assert_eq!(db.ops_count(), 2);
        assert_eq!(db.last_persist_ops_count(), 2);
    }

    #[test]
    fn test_encode_failure_replaced_by_fail_reply() {
        let bad = Reply::rows(vec![FieldType::Int], vec![Field::Int(i64::MAX)]);
        let (frame, ok) = encode_reply(&bad);
        assert!(!ok);

        let reply = Reply::decode(&frame).unwrap();
        assert!(!reply.is_ok());
        assert!(reply.first().unwrap().to_string().starts_with("Could not encode reply"));

        let (_, ok) = encode_reply(&Reply::single(Field::Bool(true)));
        assert!(ok);
    }

    #[test]
    fn test_unencodable_write_is_not_counted() {
        let (dir, server) = make_server();
        let db = server.default_database();
        let store = db.store();

        // double the count of "k" until it no longer fits a reply slot
        let dump = dir.path().join("doubling");
        store.add("k");
        for _ in 0..27 {
            store.persist_to_file(&dump).unwrap();
            store.merge_from_file(&dump).unwrap();
        }
        assert_eq!(store.has_count("k"), (true, 1 << 27));

        let replies = run(&server, b"c", "ADD k\nPING");
        assert!(!replies[0].is_ok());
        assert!(replies[0].first().unwrap().to_string().starts_with("Could not encode reply"));
        assert!(replies[1].is_ok());
        assert_eq!(db.ops_count(), 0);
        assert_eq!(server.metrics().snapshot().failed_commands, 1);
    }
}
