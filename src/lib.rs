//! Tris - multi-database trie server
//!
//! Named reference-counting tries served over one multiplexed TCP endpoint.
//! Clients send newline separated text commands tagged with an identity and
//! receive typed binary replies.

pub mod client;
pub mod command;
pub mod config;
pub mod database_manager;
pub mod error;
pub mod metrics;
pub mod protocol;
mod reactor;
pub mod server;
pub mod session;
pub mod transport;
pub mod trie;

pub use client::Client;
pub use config::ServerConfig;
pub use database_manager::{Database, DatabaseManager, DEFAULT_DB};
pub use error::{Result, TrisError};
pub use protocol::{Field, FieldType, Reply, ReturnCode};
pub use server::{Server, ServerState};
pub use trie::RefCountTrie;
