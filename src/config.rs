//! Server configuration
//!
//! Defaults mirror a small single-host deployment. A config can be loaded
//! from a JSON file; missing keys fall back to the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrisError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport protocol of the bound endpoint (only "tcp")
    pub protocol: String,
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,

    /// Directory holding one dump file per database
    pub data_dir: PathBuf,
    /// File name prefix marking database dumps inside `data_dir`
    pub storage_prefix: String,

    /// Persist a database after this many writes (0 disables)
    pub persist_ops_limit: u64,
    /// Persist a dirty database after this many seconds (0 disables)
    pub persist_interval_secs: u64,

    /// Reactor cycle length while requests are in flight
    pub cycle_length_us: u64,
    /// Transport poll timeout while idle
    pub idle_poll_timeout_ms: u64,
    /// How often the reactor looks at lifecycle state and persistence timers
    pub check_state_interval_ms: u64,
    /// Sleep between checks while draining in-flight requests on shutdown
    pub stop_poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6000,
            data_dir: PathBuf::from("./tris_data"),
            storage_prefix: "trie_".to_string(),
            persist_ops_limit: 100,
            persist_interval_secs: 300,
            cycle_length_us: 500,
            idle_poll_timeout_ms: 1000,
            check_state_interval_ms: 100,
            stop_poll_interval_ms: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Endpoint string, e.g. `tcp://127.0.0.1:6000`
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn cycle_length(&self) -> Duration {
        Duration::from_micros(self.cycle_length_us)
    }

    pub fn idle_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_poll_timeout_ms)
    }

    pub fn check_state_interval(&self) -> Duration {
        Duration::from_millis(self.check_state_interval_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol != "tcp" {
            return Err(TrisError::InvalidConfig(format!(
                "unsupported protocol '{}', only tcp is available",
                self.protocol
            )));
        }
        if self.host.is_empty() {
            return Err(TrisError::InvalidConfig("host must not be empty".into()));
        }
        if self.storage_prefix.is_empty() || self.storage_prefix.starts_with('.') {
            return Err(TrisError::InvalidConfig(
                "storage_prefix must be non-empty and must not start with '.'".into(),
            ));
        }
        if self.storage_prefix.contains('/') {
            return Err(TrisError::InvalidConfig("storage_prefix must not contain '/'".into()));
        }
        if self.cycle_length_us == 0 {
            return Err(TrisError::InvalidConfig("cycle_length_us must be > 0".into()));
        }
        if self.idle_poll_timeout_ms == 0 || self.check_state_interval_ms == 0 {
            return Err(TrisError::InvalidConfig(
                "idle_poll_timeout_ms and check_state_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint(), "tcp://127.0.0.1:6000");
        assert_eq!(config.persist_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.protocol = "ipc".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage_prefix = String::new();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage_prefix = ".hidden".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.cycle_length_us = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tris.json");
        std::fs::write(&path, r#"{ "port": 7000, "storage_prefix": "db_" }"#).unwrap();

        let config = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.storage_prefix, "db_");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.persist_ops_limit, 100);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tris.json");
        std::fs::write(&path, "{ port: ").unwrap();
        assert!(ServerConfig::from_json_file(&path).is_err());
    }
}
