//! Error types for KeyFS
//!
//! This module defines the common error taxonomy used throughout the system.

use std::fmt;
use thiserror::Error;

/// Common result type for KeyFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for KeyFS
#[derive(Debug, Error)]
pub enum Error {
    // Key-value status classes
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on key {key}")]
    VersionConflict { key: String },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("I/O error: {0}")]
    Io(String),

    // Replication errors
    #[error("cluster version mismatch: expected {expected}, drive reports {actual}")]
    ClusterFencingMismatch { expected: i64, actual: i64 },

    #[error("partial write on key {key}")]
    PartialWrite { key: String },

    #[error("quorum unavailable: {0}")]
    QuorumUnavailable(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    // Path errors
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("too many levels of symbolic links resolving {path}")]
    SymlinkLoop { path: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("log replay out of order: expected sequence {expected}, got {actual}")]
    LogOutOfOrder { expected: i64, actual: i64 },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("filesystem unsafe: {0}")]
    Unsafe(FatalError),
}

/// A compound operation failed and its undo failed too.
///
/// Once raised the filesystem must stop accepting mutations until an
/// operator runs the repair tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalError {
    /// Compound operation that was running (e.g. `rename /a -> /b`)
    pub operation: String,
    /// Sub-step whose undo failed
    pub step: String,
    /// Error reported by the undo
    pub cause: String,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} could not undo step '{}': {}",
            self.operation, self.step, self.cause
        )
    }
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a version conflict error
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::VersionConflict { key: key.into() }
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::ClusterFencingMismatch { .. }
                | Self::PartialWrite { .. }
                | Self::Io(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an optimistic-concurrency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Check if this error means the filesystem must halt
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsafe(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
