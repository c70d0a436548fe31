//! Error types for the execution core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// No runner matched, image pull failed, workspace creation failed.
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Missing ACK, heartbeat loss, duplicate completion.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Transient database/container-API/socket failures after retries
    /// are exhausted.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
