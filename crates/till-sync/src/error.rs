//! Error types for till-sync

use thiserror::Error;

/// Result type alias using till-sync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in till-sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local store failure that is not a SQLite error
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote call failed (network, auth, 5xx, protocol violation)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A record could not be decoded; only that record is affected
    #[error("Malformed record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// Local write attempted on a record awaiting conflict resolution
    #[error("Record is in conflict: {0}")]
    RecordInConflict(String),

    /// Resolution received for a record with no open conflict
    #[error("No open conflict for {0}")]
    ConflictNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The background sync task is no longer running
    #[error("Sync engine is shut down")]
    ShutDown,
}

impl Error {
    /// Whether the failure came from talking to the server.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Transport(_))
    }

    /// Whether the failure came from local persistence.
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Sqlite(_))
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub(crate) fn malformed(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
