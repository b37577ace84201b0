//! Backend driver error types.

use thiserror::Error;

/// Result type for backend driver operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while driving a workspace backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend command failed.
    #[error("backend {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Backend was not found.
    #[error("backend not found: {0}")]
    NotFound(String),

    /// Failed to parse backend command output.
    #[error("failed to parse backend output: {0}")]
    ParseError(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
