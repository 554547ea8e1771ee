//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the kernel agent.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (malformed input, bad resource spec text).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (missing kernel, missing recovery file, missing container).
    #[error("not found: {0}")]
    NotFound(String),

    /// A kernel with the same id is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Path confinement violations. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// REPL channel or remote-exec connectivity failures. Retried by callers
    /// that own a retry budget.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend cannot perform this operation at all.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Operation invoked in a lifecycle state that forbids it (e.g. after close).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Container engine or orchestrator reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether repeating the operation could succeed.
    ///
    /// Only connectivity failures qualify; capability mismatches and
    /// confinement violations never change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Short machine-readable code, used in failure payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::Transport(_) => "UNAVAILABLE",
            Error::NotImplemented(_) => "UNIMPLEMENTED",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Backend(_) => "BACKEND",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
