//! Common error types for kgdb

use thiserror::Error;

/// Common result type for kgdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across kgdb crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of a stored column failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the entity's current state
    /// (e.g. approving a staging entry that was already reviewed)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Upstream source failed after the fetch client gave up.
    ///
    /// `rate_limited` is set when the final failure was a 429 so that the
    /// job layer can schedule a delayed re-run instead of failing outright.
    #[error("Upstream error: {message}")]
    Upstream { message: String, rate_limited: bool },

    /// Work stopped because its cancellation token fired
    #[error("Cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Upstream failure that was not caused by rate limiting
    pub fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream {
            message: message.into(),
            rate_limited: false,
        }
    }

    /// True when the error should be retried later by the job system
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::Upstream { rate_limited: true, .. })
    }

    /// True for "database is locked" contention errors
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}
