//! DatabaseManager - Thread-safe registry of named trie databases
//!
//! Every database is one `RefCountTrie` persisted to its own file,
//! `<data_dir>/<storage_prefix><name>`. The manager owns the name → database
//! map; each `Database` carries its write counter and persistence state.
//!
//! # Persistence policy
//!
//! - `OpsCount` grows by one per successful write command.
//! - A persist is skipped while `LastPersistOpsCount == OpsCount`, unless it
//!   is forced (CREATE, IMPORT, MERGE, SAVE).
//! - Ops driven: after `persist_ops_limit` writes since the last persist.
//! - Time driven: a dirty database older than `persist_interval` since its
//!   last persist (or since it was registered).
//!
//! # Usage
//!
//! ```no_run
//! use tris::config::ServerConfig;
//! use tris::database_manager::DatabaseManager;
//!
//! let manager = DatabaseManager::from_config(&ServerConfig::default());
//! manager.load_all().unwrap();
//!
//! let db = manager.create_database("words").unwrap();
//! db.store().add("hello");
//! db.record_write();
//! db.persist(false).unwrap();
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, TrisError};
use crate::trie::RefCountTrie;

/// Reserved database every new session starts on.
pub const DEFAULT_DB: &str = "0";

/// Persistence thresholds handed to every database the manager creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistPolicy {
    pub ops_limit: u64,
    pub interval: Duration,
}

#[derive(Debug)]
struct PersistState {
    last_ops_count: u64,
    last_time: Option<SystemTime>,
    last_instant: Instant,
}

/// Database entry in the manager
pub struct Database {
    pub name: String,
    store: RefCountTrie,
    path: PathBuf,
    ops_count: AtomicU64,
    persist_state: Mutex<PersistState>,
    pub persist_ops_limit: u64,
    pub persist_interval: Duration,
    /// Held around file copies, bulk loads and dumps of this database
    maintenance: Mutex<()>,
}

impl Database {
    pub fn new(name: String, store: RefCountTrie, path: PathBuf, policy: PersistPolicy) -> Self {
        Self {
            name,
            store,
            path,
            ops_count: AtomicU64::new(0),
            persist_state: Mutex::new(PersistState {
                last_ops_count: 0,
                last_time: None,
                last_instant: Instant::now(),
            }),
            persist_ops_limit: policy.ops_limit,
            persist_interval: policy.interval,
            maintenance: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &RefCountTrie {
        &self.store
    }

    /// Canonical dump file of this database
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Count one applied write, returning the new total.
    pub fn record_write(&self) -> u64 {
        self.ops_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ops_count(&self) -> u64 {
        self.ops_count.load(Ordering::SeqCst)
    }

    pub fn last_persist_ops_count(&self) -> u64 {
        self.persist_state.lock().last_ops_count
    }

    pub fn last_persist_time(&self) -> Option<SystemTime> {
        self.persist_state.lock().last_time
    }

    /// Writes applied since the last persist
    pub fn pending_ops(&self) -> u64 {
        self.ops_count().saturating_sub(self.last_persist_ops_count())
    }

    pub fn is_dirty(&self) -> bool {
        self.pending_ops() > 0
    }

    pub fn ops_limit_reached(&self) -> bool {
        self.persist_ops_limit > 0 && self.pending_ops() >= self.persist_ops_limit
    }

    pub fn interval_elapsed(&self, now: Instant) -> bool {
        if self.persist_interval.is_zero() || !self.is_dirty() {
            return false;
        }
        let last = self.persist_state.lock().last_instant;
        now.saturating_duration_since(last) >= self.persist_interval
    }

    /// Write the trie to its file.
    ///
    /// Returns `Ok(false)` without touching the disk when nothing changed
    /// since the last persist and `force` is not set.
    pub fn persist(&self, force: bool) -> Result<bool> {
        let _guard = self.maintenance.lock();
        let ops = self.ops_count();
        if !force && self.persist_state.lock().last_ops_count == ops {
            return Ok(false);
        }

        self.store.persist_to_file(&self.path)?;

        let mut state = self.persist_state.lock();
        state.last_ops_count = ops;
        state.last_time = Some(SystemTime::now());
        state.last_instant = Instant::now();
        debug!(db = %self.name, ops, "persisted database");
        Ok(true)
    }

    /// Copy the current dump file to `dir/<name>`, creating `dir` on first use.
    ///
    /// Returns `Ok(false)` if the database has no file yet.
    pub fn backup(&self, dir: &Path) -> Result<bool> {
        let _guard = self.maintenance.lock();
        if !self.path.exists() {
            return Ok(false);
        }
        fs::create_dir_all(dir)?;
        fs::copy(&self.path, dir.join(&self.name))?;
        Ok(true)
    }

    /// Merge a dump file into this database. Counts as one write.
    pub fn merge_from_file(&self, file: &Path) -> Result<usize> {
        let merged = {
            let _guard = self.maintenance.lock();
            self.store.merge_from_file(file)?
        };
        self.record_write();
        Ok(merged)
    }

    fn load_contents(&self, file: &Path) -> Result<()> {
        let _guard = self.maintenance.lock();
        let loaded = RefCountTrie::load_from_file(file)?;
        self.store.replace_with(loaded);
        Ok(())
    }
}

/// Database information for INFO / listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub keys: usize,
    pub ops_count: u64,
    pub last_persist_ops_count: u64,
}

/// Outcome of scanning the data directory at startup
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Outcome of persisting every database
#[derive(Debug, Default)]
pub struct PersistReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, TrisError)>,
}

/// DatabaseManager - manages all named databases of one server
pub struct DatabaseManager {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    data_dir: PathBuf,
    storage_prefix: String,
    policy: PersistPolicy,
}

impl DatabaseManager {
    pub fn new(data_dir: PathBuf, storage_prefix: impl Into<String>, policy: PersistPolicy) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            data_dir,
            storage_prefix: storage_prefix.into(),
            policy,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.storage_prefix.clone(),
            PersistPolicy {
                ops_limit: config.persist_ops_limit,
                interval: config.persist_interval(),
            },
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Validate database name
    ///
    /// Allowed characters: [a-zA-Z0-9_-]
    /// Length: 1-128 characters
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 128 {
            return Err(TrisError::InvalidDatabaseName(
                "Name must be 1-128 characters".to_string()
            ));
        }

        let valid = name.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        });

        if !valid {
            return Err(TrisError::InvalidDatabaseName(
                "Name can only contain a-z, A-Z, 0-9, _, -".to_string()
            ));
        }

        Ok(())
    }

    pub fn db_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}{}", self.storage_prefix, name))
    }

    pub fn backup_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}_bak", name))
    }

    fn new_database(&self, name: &str, store: RefCountTrie) -> Arc<Database> {
        Arc::new(Database::new(name.to_string(), store, self.db_path(name), self.policy))
    }

    /// Register and persist a new, empty database.
    ///
    /// The file exists on disk before this returns `Ok`; if writing it fails
    /// the entry is removed again.
    pub fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        Self::validate_name(name)?;

        let db = {
            let mut databases = self.databases.write();
            if databases.contains_key(name) {
                return Err(TrisError::DatabaseExists(name.to_string()));
            }
            let db = self.new_database(name, RefCountTrie::new());
            databases.insert(name.to_string(), Arc::clone(&db));
            db
        };

        if let Err(e) = db.persist(true) {
            self.databases.write().remove(name);
            return Err(e);
        }
        info!(db = name, "created database");
        Ok(db)
    }

    /// Load `name` from its dump file, replacing the contents of an existing
    /// entry or registering a new one. Nothing is registered if the dump
    /// cannot be read.
    pub fn load_database(&self, name: &str) -> Result<Arc<Database>> {
        Self::validate_name(name)?;
        let path = self.db_path(name);

        if let Ok(existing) = self.get_database(name) {
            existing.load_contents(&path)?;
            return Ok(existing);
        }

        let store = RefCountTrie::load_from_file(&path)?;
        let db = self.new_database(name, store);
        self.databases.write().insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    /// Create database `name` from an arbitrary dump file and persist it.
    ///
    /// The name is reserved first; any failure afterwards rolls the entry
    /// back so a retry starts clean.
    pub fn import_database(&self, file: &Path, name: &str) -> Result<Arc<Database>> {
        Self::validate_name(name)?;

        let db = {
            let mut databases = self.databases.write();
            if databases.contains_key(name) {
                return Err(TrisError::DatabaseExists(name.to_string()));
            }
            let db = self.new_database(name, RefCountTrie::new());
            databases.insert(name.to_string(), Arc::clone(&db));
            db
        };

        let imported = db.load_contents(file).and_then(|_| db.persist(true));
        if let Err(e) = imported {
            self.databases.write().remove(name);
            return Err(e);
        }
        info!(db = name, file = %file.display(), keys = db.store().len(), "imported database");
        Ok(db)
    }

    /// Get a database by name
    pub fn get_database(&self, name: &str) -> Result<Arc<Database>> {
        let databases = self.databases.read();
        databases.get(name)
            .cloned()
            .ok_or_else(|| TrisError::DatabaseNotFound(name.to_string()))
    }

    /// Check if a database exists
    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
    }

    /// Database names in lexical order
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// List all databases, in name order
    pub fn list_databases(&self) -> Vec<DatabaseInfo> {
        self.database_names()
            .into_iter()
            .filter_map(|name| self.get_database(&name).ok())
            .map(|db| DatabaseInfo {
                name: db.name.clone(),
                keys: db.store().len(),
                ops_count: db.ops_count(),
                last_persist_ops_count: db.last_persist_ops_count(),
            })
            .collect()
    }

    fn all(&self) -> Vec<Arc<Database>> {
        self.databases.read().values().cloned().collect()
    }

    /// Persist `name` if it changed since its last persist.
    pub fn persist(&self, name: &str) -> Result<bool> {
        self.get_database(name)?.persist(false)
    }

    /// Copy the on-disk file of `name` into its backup directory.
    pub fn backup(&self, name: &str) -> Result<bool> {
        let db = self.get_database(name)?;
        db.backup(&self.backup_dir(name))
    }

    /// Load every `<prefix><name>` file of the data directory.
    ///
    /// Files are loaded in parallel; unreadable dumps are reported and
    /// skipped. An unreadable data directory is an error. The default
    /// database is created empty afterwards unless a file defined it.
    pub fn load_all(&self) -> Result<LoadReport> {
        fs::create_dir_all(&self.data_dir)?;

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_prefix(&self.storage_prefix) {
                if Self::validate_name(name).is_ok() {
                    names.push(name.to_string());
                } else {
                    debug!(file = %file_name, "skipping file with invalid database name");
                }
            }
        }

        let results: Vec<(String, Result<Arc<Database>>)> = names
            .into_par_iter()
            .map(|name| {
                let loaded = self.load_database(&name);
                (name, loaded)
            })
            .collect();

        let mut report = LoadReport::default();
        for (name, result) in results {
            match result {
                Ok(db) => {
                    info!(db = %name, keys = db.store().len(), "loaded database");
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(db = %name, error = %e, "failed to load database file");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report.loaded.sort();

        self.ensure_default();
        Ok(report)
    }

    /// The default database, registered empty if it does not exist yet.
    pub fn ensure_default(&self) -> Arc<Database> {
        if let Ok(db) = self.get_database(DEFAULT_DB) {
            return db;
        }
        let mut databases = self.databases.write();
        Arc::clone(
            databases
                .entry(DEFAULT_DB.to_string())
                .or_insert_with(|| self.new_database(DEFAULT_DB, RefCountTrie::new())),
        )
    }

    /// Persist every changed database in parallel.
    pub fn persist_all(&self) -> PersistReport {
        let results: Vec<(String, Result<bool>)> = self.all()
            .par_iter()
            .map(|db| (db.name.clone(), db.persist(false)))
            .collect();

        let mut report = PersistReport::default();
        for (name, result) in results {
            match result {
                Ok(true) => report.written.push(name),
                Ok(false) => {}
                Err(e) => report.failed.push((name, e)),
            }
        }
        report.written.sort();
        report
    }

    /// Persist the databases whose persist interval has elapsed.
    pub fn persist_due(&self, now: Instant) -> PersistReport {
        let mut report = PersistReport::default();
        for db in self.all().into_iter().filter(|db| db.interval_elapsed(now)) {
            match db.persist(false) {
                Ok(true) => report.written.push(db.name.clone()),
                Ok(false) => {}
                Err(e) => report.failed.push((db.name.clone(), e)),
            }
        }
        report
    }
}
