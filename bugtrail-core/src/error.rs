//! Error type shared by every fallible operation in `bugtrail-core`.
//!
//! Hash computation never returns this type: a report whose hash could not be
//! computed precisely still gets a (degraded) hash, see [`crate::hash::Degraded`].
//! Everything that reaches the storage layer does, and any error there aborts
//! the whole batch.

use thiserror::Error;

/// Main error type for the bugtrail library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown hash type: {0}")]
    UnknownHashType(String),

    #[error("unknown detection status: {0}")]
    UnknownStatus(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("run '{0}' is already being stored")]
    RunBusy(String),

    #[error("store cancelled before commit")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hash worker failed: {0}")]
    Worker(String),
}

/// Convenience type alias for Result using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Worker(err.to_string())
        }
    }
}
