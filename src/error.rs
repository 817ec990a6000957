//! Error types for the tris server

use thiserror::Error;

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, TrisError>;

#[derive(Error, Debug)]
pub enum TrisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command {0} has already been registered.")]
    CommandAlreadyRegistered(String),

    #[error("Unknown Command {0}.")]
    UnknownCommand(String),

    #[error("{command} expects {expected} argument(s), got {got}")]
    MissingArgument {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Database {0} already exists.")]
    DatabaseExists(String),

    #[error("Database {0} does not exist.")]
    DatabaseNotFound(String),

    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),

    #[error("Manually saving the default database is not permitted.")]
    DefaultDatabaseProtected,
}

impl TrisError {
    /// Stable error code, logged as the `code` field
    pub fn code(&self) -> &'static str {
        match self {
            TrisError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            TrisError::MissingArgument { .. } => "MISSING_ARGUMENT",
            TrisError::DatabaseExists(_) => "DATABASE_EXISTS",
            TrisError::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
            TrisError::InvalidDatabaseName(_) => "INVALID_DATABASE_NAME",
            TrisError::DefaultDatabaseProtected => "DEFAULT_DATABASE_PROTECTED",
            TrisError::Protocol(_) => "PROTOCOL_ERROR",
            TrisError::InvalidConfig(_) => "INVALID_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }
}
