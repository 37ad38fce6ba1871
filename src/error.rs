//! Error type shared by the framing, connection and dispatch layers.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the server framework.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A header slice was not exactly [`HEADER_LEN`](crate::codec::HEADER_LEN) bytes.
    #[error("invalid frame header: expected 8 bytes, got {0}")]
    InvalidHeader(usize),

    /// The header announced a payload larger than the configured maximum.
    #[error("message of {len} bytes exceeds max package size {max}")]
    OversizedMessage { len: u32, max: u32 },

    #[error("connection closed")]
    ConnectionClosed,

    /// The writer has not drained the previous frame yet.
    #[error("outbound channel full")]
    OutboundFull,

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("property has a different type: {0}")]
    PropertyTypeMismatch(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(u32),

    #[error("router already registered for message id {0}")]
    DuplicateRoute(u32),

    #[error("invalid worker pool: {0}")]
    InvalidWorkerPool(&'static str),

    #[error("worker pool already started")]
    WorkerPoolStarted,

    #[error("worker pool not started")]
    WorkerPoolNotStarted,

    #[error("worker {0} is no longer accepting requests")]
    WorkerUnavailable(usize),

    #[error("server already started")]
    AlreadyStarted,

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
}

impl Error {
    /// Configuration mistakes that must abort startup instead of degrading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DuplicateRoute(_)
                | Error::InvalidWorkerPool(_)
                | Error::WorkerPoolStarted
                | Error::InvalidAddress(_)
        )
    }
}
