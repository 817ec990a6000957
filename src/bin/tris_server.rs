//! tris-server - trie collection server
//!
//! Usage: tris-server [--config tris.json] [--host H] [--port P] [--data-dir DIR] ...
//!
//! Settings come from the defaults, then the JSON config file, then flags.
//! SIGINT/SIGTERM (or the SHUTDOWN command) stop the server gracefully:
//! in-flight requests finish and every changed database is written to disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tris::config::ServerConfig;
use tris::server::Server;

#[derive(Parser, Debug)]
#[command(name = "tris-server", version, about = "Multi-database trie server")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the database files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// File name prefix of database files
    #[arg(long)]
    storage_prefix: Option<String>,

    /// Persist a database after this many writes (0 disables)
    #[arg(long)]
    persist_ops_limit: Option<u64>,

    /// Persist a changed database after this many seconds (0 disables)
    #[arg(long)]
    persist_interval_secs: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(prefix) = self.storage_prefix {
            config.storage_prefix = prefix;
        }
        if let Some(limit) = self.persist_ops_limit {
            config.persist_ops_limit = limit;
        }
        if let Some(secs) = self.persist_interval_secs {
            config.persist_interval_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tris=info")))
        .init();

    let config = Args::parse().into_config()?;
    let server = Arc::new(Server::new(config).context("invalid configuration")?);

    let report = server.initialize().context("failed to load databases")?;
    for (name, e) in &report.failed {
        warn!(db = %name, error = %e, "database skipped");
    }

    // Set up signal handler for graceful shutdown
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    let server_for_signal = Arc::clone(&server);
    thread::spawn(move || {
        for sig in signals.forever() {
            info!(signal = sig, "signal received, stopping");
            server_for_signal.stop();
        }
    });

    let reactor = server.start().await.context("failed to start transport")?;
    server.wait_stopped().await;
    reactor.await.context("reactor task failed")?;

    info!("exiting");
    Ok(())
}
