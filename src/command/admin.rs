//! Administrative commands: sessions, database lifecycle and server control

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use sysinfo::System;
use tracing::{error, info};

use super::{AccessFlags, Command, CommandRegistry, ResponseShape, STRING_REPLY};
use crate::database_manager::DEFAULT_DB;
use crate::error::{Result, TrisError};
use crate::protocol::{Field, Reply};
use crate::server::Server;
use crate::session::Session;

pub(super) fn register(registry: &mut CommandRegistry) -> Result<()> {
    registry.register(Arc::new(Ping))?;
    registry.register(Arc::new(Info))?;
    registry.register(Arc::new(DbInfo))?;
    registry.register(Arc::new(Select))?;
    registry.register(Arc::new(Create))?;
    registry.register(Arc::new(Timing))?;
    registry.register(Arc::new(Save))?;
    registry.register(Arc::new(Import))?;
    registry.register(Arc::new(Merge))?;
    registry.register(Arc::new(Shutdown))?;
    registry.register(Arc::new(Help))?;
    registry.register(Arc::new(Exit))?;
    Ok(())
}

/// Check system memory usage percentage.
///
/// Returns 0.0 if unable to query.
fn check_memory_usage() -> f32 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    let used = sys.used_memory();
    (used as f64 / total as f64 * 100.0) as f32
}

/// Persist after a command that changed the database outside the write path.
fn force_persist(server: &Server, name: &str) -> Option<Reply> {
    let db = server.databases().get_database(name).ok()?;
    match db.persist(true) {
        Ok(_) => None,
        Err(e) => {
            error!(db = name, code = e.code(), error = %e, "persist failed");
            Some(Reply::fail(format!("Could not persist database {}: {}", name, e)))
        }
    }
}

pub struct Ping;

impl Command for Ping {
    fn name(&self) -> &'static str {
        "PING"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        STRING_REPLY
    }
    fn help(&self) -> &'static str {
        "PING\n\nReplies with a heartbeat."
    }
    fn execute(&self, _: &Server, _: &mut Session, _: &[String]) -> Result<Reply> {
        Ok(Reply::single(Field::text("heartbeat")))
    }
}

pub struct Info;

impl Command for Info {
    fn name(&self) -> &'static str {
        "INFO"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        STRING_REPLY
    }
    fn help(&self) -> &'static str {
        "INFO\n\nShows server settings, databases, counters and the calling session."
    }
    fn execute(&self, server: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        let config = server.config();
        let metrics = server.metrics().snapshot();
        let port = server.local_addr().map(|a| a.port()).unwrap_or(config.port);

        let mut out = String::from("SERVER\n");
        let _ = writeln!(out, "Tris {}.", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "Host: {}", config.host);
        let _ = writeln!(out, "Port: {}", port);
        let _ = writeln!(out, "DataDir: {}", config.data_dir.display());
        let _ = writeln!(out, "Uptime: {}s", metrics.uptime_secs);
        let _ = writeln!(out, "Memory: {:.1}% used", check_memory_usage());

        out.push_str("\nDatabases:\n");
        let _ = writeln!(out, "  Default DB: {}", DEFAULT_DB);
        out.push_str("  User DBs:\n");
        let user_dbs = server.databases().list_databases().into_iter().filter(|db| db.name != DEFAULT_DB);
        for (n, db) in user_dbs.enumerate() {
            let marker = if db.name == session.active_db_name() { "* " } else { "" };
            let _ = writeln!(
                out,
                "    {}) {}{} (keys: {}, ops: {}, persisted at: {})",
                n + 1,
                marker,
                db.name,
                db.keys,
                db.ops_count,
                db.last_persist_ops_count
            );
        }

        let _ = writeln!(out, "\nActiveClients: {}", server.sessions().len());
        let _ = writeln!(out, "Requests Total: {}", metrics.requests_total);
        let _ = writeln!(out, "Requests Running: {}", metrics.requests_running);
        let _ = writeln!(out, "Commands Processed: {}", metrics.commands_processed);
        let _ = writeln!(out, "Commands Failed: {}", metrics.failed_commands);
        let _ = writeln!(out, "Avg Command Time: {}us", metrics.command_avg_us);
        let _ = writeln!(out, "Slow Commands: {}", metrics.slow_command_count);
        for slow in &metrics.recent_slow_commands {
            let _ = writeln!(out, "  {} took {}us at +{}ms", slow.command, slow.duration_us, slow.timestamp_ms);
        }

        out.push_str("\nCLIENT\n");
        let _ = writeln!(out, "Session: {}", session.id);
        let _ = writeln!(out, "Active DB: {}", session.active_db_name());
        let _ = writeln!(out, "Show exec time: {}", session.show_exec_time);

        Ok(Reply::single(Field::text(out)))
    }
}

pub struct DbInfo;

impl Command for DbInfo {
    fn name(&self) -> &'static str {
        "DBINFO"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        STRING_REPLY
    }
    fn help(&self) -> &'static str {
        "DBINFO\n\nShows counters and persistence settings of the active database."
    }
    fn execute(&self, _: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        let db = &session.active_db;
        let last_persist = db
            .last_persist_time()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|| "never".to_string());

        let text = format!(
            "DBINFO for database {}:\n Keys: {}\n OpsCount: {}\n LastPersistOpsCount: {}\n PersistOpsLimit: {}\n LastPersistTime: {}\n PersistInterval: {}s\n",
            db.name,
            db.store().len(),
            db.ops_count(),
            db.last_persist_ops_count(),
            db.persist_ops_limit,
            last_persist,
            db.persist_interval.as_secs(),
        );
        Ok(Reply::single(Field::text(text)))
    }
}

pub struct Select;

impl Command for Select {
    fn name(&self) -> &'static str {
        "SELECT"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "SELECT <name>\n\nMakes <name> the active database of this session."
    }
    fn execute(&self, server: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        let db = server.databases().get_database(&args[0])?;
        session.select(db);
        Ok(Reply::empty())
    }
}

pub struct Create;

impl Command for Create {
    fn name(&self) -> &'static str {
        "CREATE"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "CREATE <name>\n\nCreates an empty database and writes it to disk."
    }
    fn execute(&self, server: &Server, _: &mut Session, args: &[String]) -> Result<Reply> {
        server.databases().create_database(&args[0])?;
        Ok(Reply::empty())
    }
}

pub struct Timing;

impl Command for Timing {
    fn name(&self) -> &'static str {
        "TIMING"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn help(&self) -> &'static str {
        "TIMING\n\nToggles logging of the execution time of this session's requests."
    }
    fn execute(&self, _: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        session.toggle_exec_time();
        Ok(Reply::empty())
    }
}

pub struct Save;

impl Command for Save {
    fn name(&self) -> &'static str {
        "SAVE"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn help(&self) -> &'static str {
        "SAVE\n\nBacks up the file of the active database, then writes it to disk."
    }
    fn execute(&self, server: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        let name = session.active_db_name().to_string();
        if name == DEFAULT_DB {
            return Err(TrisError::DefaultDatabaseProtected);
        }

        if let Err(e) = server.databases().backup(&name) {
            error!(db = %name, code = e.code(), error = %e, "backup failed");
            return Ok(Reply::fail(format!("Backup failed: {}", e)));
        }
        Ok(force_persist(server, &name).unwrap_or_else(Reply::empty))
    }
}

pub struct Import;

impl Command for Import {
    fn name(&self) -> &'static str {
        "IMPORT"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn arity(&self) -> usize {
        2
    }
    fn help(&self) -> &'static str {
        "IMPORT <file> <name>\n\nCreates database <name> from the dump <file>."
    }
    fn execute(&self, server: &Server, _: &mut Session, args: &[String]) -> Result<Reply> {
        match server.databases().import_database(Path::new(&args[0]), &args[1]) {
            Ok(_) => Ok(Reply::empty()),
            Err(e @ (TrisError::DatabaseExists(_) | TrisError::InvalidDatabaseName(_))) => Err(e),
            Err(e) => {
                error!(file = %args[0], db = %args[1], code = e.code(), error = %e, "import failed");
                Ok(Reply::fail(format!("Database import failed: {}", e)))
            }
        }
    }
}

pub struct Merge;

impl Command for Merge {
    fn name(&self) -> &'static str {
        "MERGE"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "MERGE <file>\n\nAdds every member of the dump <file> to the active database, summing counts."
    }
    fn execute(&self, server: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        let db = Arc::clone(&session.active_db);
        match db.merge_from_file(Path::new(&args[0])) {
            Ok(merged) => info!(db = %db.name, file = %args[0], merged, "merged dump"),
            Err(e) => {
                error!(db = %db.name, file = %args[0], code = e.code(), error = %e, "merge failed");
                return Ok(Reply::fail(format!("Database merge failed: {}", e)));
            }
        }
        Ok(force_persist(server, &db.name).unwrap_or_else(Reply::empty))
    }
}

pub struct Shutdown;

impl Command for Shutdown {
    fn name(&self) -> &'static str {
        "SHUTDOWN"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn help(&self) -> &'static str {
        "SHUTDOWN\n\nPersists every database and stops the server."
    }
    fn execute(&self, server: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        info!(session = %session.id, "shutdown requested");
        server.stop();
        Ok(Reply::empty())
    }
}

pub struct Help;

impl Command for Help {
    fn name(&self) -> &'static str {
        "HELP"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        STRING_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "HELP <command>\n\nShows the help text of <command>."
    }
    fn execute(&self, server: &Server, _: &mut Session, args: &[String]) -> Result<Reply> {
        let name = args[0].to_uppercase();
        let text = match server.commands().get(&name) {
            Some(command) => format!("\n{}\n", command.help()),
            None => format!("Unknown Command {}.\n\n{}", name, self.help()),
        };
        Ok(Reply::single(Field::text(text)))
    }
}

pub struct Exit;

impl Command for Exit {
    fn name(&self) -> &'static str {
        "EXIT"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::ADMIN
    }
    fn shape(&self) -> ResponseShape {
        ResponseShape::EMPTY
    }
    fn help(&self) -> &'static str {
        "EXIT\n\nEnds this session."
    }
    fn execute(&self, server: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        server.sessions().schedule_removal(session.id.clone());
        Ok(Reply::empty())
    }
}
