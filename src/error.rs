//! WolfMeta Error Types

use thiserror::Error;

use crate::id::LogId;

/// Result type alias for WolfMeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMeta error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Operation log errors
    #[error("Operation log error: {0}")]
    Oplog(String),

    #[error("Operation log corrupted at {log_id}: {reason}")]
    OplogCorrupted { log_id: LogId, reason: String },

    // Encoding errors
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Cluster state errors
    #[error("State error: {0}")]
    State(String),

    #[error("State database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader available")]
    NoLeader,

    #[error("Node not eligible for membership: {0}")]
    NodeNotEligible(String),

    #[error("Quorum not reached for {0} before timeout")]
    QuorumTimeout(LogId),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::QuorumTimeout(_)
                | Error::Network(_)
        )
    }

    /// Check if this error ends the local node's participation.
    ///
    /// A node that cannot durably append to its operation log must stop
    /// replicating instead of carrying on with a log it cannot trust.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Oplog(_) | Error::OplogCorrupted { .. } | Error::Io(_)
        )
    }
}
