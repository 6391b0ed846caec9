//! Error types for ioproc.

use thiserror::Error;

/// Main error type for all ioproc operations.
#[derive(Debug, Error)]
pub enum IoprocError {
    /// I/O error on one of the worker pipes or diagnostic channels.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, oversized payload, undecodable
    /// response). Always fatal to the current worker generation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker executable could not be launched.
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The client was closed before or while the request was handled.
    #[error("client was closed")]
    Closed,

    /// The caller-side wait exceeded its timeout. The request itself is
    /// forgotten by the engine; a late response is dropped.
    #[error("request timed out")]
    Timeout,

    /// The worker answered with a non-zero error code. Carries the OS-style
    /// code and message from the response; a crashed generation surfaces
    /// here with [`ERR_WORKER_CRASH`](crate::protocol::ERR_WORKER_CRASH).
    #[error("operation failed: {errstr} (errcode {errcode})")]
    Operation { errcode: i32, errstr: String },
}

impl IoprocError {
    /// The OS error code of an operation failure, if this is one.
    pub fn errcode(&self) -> Option<i32> {
        match self {
            IoprocError::Operation { errcode, .. } => Some(*errcode),
            _ => None,
        }
    }
}

/// Result type alias using IoprocError.
pub type Result<T> = std::result::Result<T, IoprocError>;
