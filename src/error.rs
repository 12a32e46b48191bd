//! Error types for TeleStore.

use thiserror::Error;

/// Common error type for TeleStore.
#[derive(Error, Debug)]
pub enum TelestoreError {
    /// Validation error for client input (bad chunk index, missing field, ...).
    ///
    /// Never mutates state; surfaced as a client error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Completion was requested before every declared chunk arrived.
    #[error("incomplete upload session: received {received} of {total} chunks")]
    IncompleteSession {
        /// Number of chunks stored so far.
        received: u32,
        /// Number of chunks declared for the session.
        total: u32,
    },

    /// The credential authority rejected the proof or could not issue credentials.
    #[error("credential error: {0}")]
    Credential(String),

    /// The remote object store failed (entity resolution, size limit, network).
    #[error("remote store error: {0}")]
    RemoteStore(String),

    /// A requested byte range does not overlap the object.
    #[error("requested range not satisfiable for a {total} byte object")]
    RangeNotSatisfiable {
        /// Size of the whole object.
        total: u64,
    },

    /// A detached transfer exceeded its ceiling.
    #[error("transfer timed out after {0} seconds")]
    Timeout(u64),

    /// A transfer was cancelled by the client.
    #[error("transfer cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Operation conflicts with the current state of a resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for TeleStore operations.
pub type Result<T> = std::result::Result<T, TelestoreError>;
