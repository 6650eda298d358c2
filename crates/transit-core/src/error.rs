//! Error types for transfer operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the transit crates.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while inspecting or transferring entries.
///
/// Paths are display strings rather than `PathBuf`s because an entry may live
/// inside an archive or an object store.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Entry does not exist.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Permission denied for an entry.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    /// Write attempted on storage that only supports reading.
    #[error("Read-only storage: {path}")]
    ReadOnly { path: String },

    /// Generic read/write failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A rename target is invalid or collides with an existing entry.
    #[error("Conflict at {path}: {message}")]
    Conflict { path: String, message: String },

    /// The backend cannot perform this operation.
    #[error("{operation} is not supported for {path}")]
    Unsupported {
        operation: &'static str,
        path: String,
    },

    /// The request cannot be started at all.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a permission error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Create a read-only storage error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly { path: path.into() }
    }

    /// Create a conflict error.
    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(operation: &'static str, path: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            path: path.into(),
        }
    }

    /// Create an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } | Self::ReadOnly { .. } => ErrorKind::PermissionDenied,
            Self::Io { .. } | Self::Unsupported { .. } | Self::InvalidRequest { .. } => {
                ErrorKind::Io
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Check if this error is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Serializable classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Io,
    Conflict,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "Not found"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::Io => write!(f, "I/O error"),
            Self::Conflict => write!(f, "Conflict"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A per-item failure recorded in an operation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// The entry that failed.
    pub path: String,
    /// What kind of failure it was.
    pub kind: ErrorKind,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Record a [`TransferError`] against a path.
    pub fn from_error(path: impl Into<String>, error: &TransferError) -> Self {
        Self::new(path, error.kind(), error.to_string())
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}
