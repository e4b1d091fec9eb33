//! Error types and handling.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoneforgeError>;

/// Stable machine-readable error codes.
///
/// These are the codes embedding surfaces (CLIs, servers) key on; the enum
/// variants of [`StoneforgeError`] may grow fields without changing codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    InvalidTransition,
    NotFound,
    Conflict,
    Permission,
    Storage,
    Integrity,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Permission => "PERMISSION",
            Self::Storage => "STORAGE",
            Self::Integrity => "INTEGRITY",
        }
    }
}

/// Errors produced by the workspace engine.
#[derive(Debug, Error)]
pub enum StoneforgeError {
    /// Bad input: shape, range, or required field missing.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Disallowed status move.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Missing element.
    #[error("element not found: {id}")]
    ElementNotFound { id: String },

    /// Missing dependency edge.
    #[error("dependency not found: {blocked_id} -> {blocker_id}")]
    DependencyNotFound {
        blocked_id: String,
        blocker_id: String,
    },

    /// Duplicate edge, duplicate tag, or any other uniqueness clash.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// A blocking edge would close a cycle. Carries the discovered path
    /// from the proposed blocker through to the waiter.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// Actor is not authorized for the operation.
    #[error("permission denied: {message}")]
    Permission { message: String },

    /// Any call on a backend after `close()`.
    #[error("storage backend is closed")]
    BackendClosed,

    /// Backend I/O or constraint violation, with statement context when the
    /// failing statement is known.
    #[error("storage error{}: {source}", .context.as_deref().map_or_else(String::new, |c| format!(" ({c})")))]
    Storage {
        #[source]
        source: rusqlite::Error,
        context: Option<String>,
    },

    /// Derived state disagrees with primary state.
    #[error("integrity error: {message}")]
    Integrity { message: String },

    /// JSON (de)serialization of a payload or metadata bag failed.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StoneforgeError {
    /// Build a validation error from anything printable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a conflict error from anything printable.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Attach statement context to a storage error.
    #[must_use]
    pub fn with_statement(source: rusqlite::Error, statement: &str) -> Self {
        Self::Storage {
            source,
            context: Some(statement.to_string()),
        }
    }

    /// The stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } | Self::Payload(_) => ErrorCode::Validation,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::ElementNotFound { .. } | Self::DependencyNotFound { .. } => ErrorCode::NotFound,
            Self::Conflict { .. } | Self::CycleDetected { .. } => ErrorCode::Conflict,
            Self::Permission { .. } => ErrorCode::Permission,
            Self::Storage { .. } | Self::BackendClosed => ErrorCode::Storage,
            Self::Integrity { .. } => ErrorCode::Integrity,
        }
    }

    /// Whether retrying the same call may succeed (busy-timeout expiry).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

impl From<rusqlite::Error> for StoneforgeError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Storage {
            source,
            context: None,
        }
    }
}
