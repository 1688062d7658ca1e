//! Error types for alluvium.
//!
//! Library crates use [`AlluviumError`] via `thiserror`. Pipeline control
//! signals (finish-branch, abort) are deliberately *not* part of this enum;
//! they live in `alluvium-pipeline` as a separate type so fatal failures and
//! flow control can never be confused.

use std::path::PathBuf;

/// Top-level error type for all alluvium operations.
#[derive(Debug, thiserror::Error)]
pub enum AlluviumError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching a resource.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Versioned content store error (branch, commit, merge, tag).
    #[error("store error: {0}")]
    Store(String),

    /// Status table error (load, save, schema).
    #[error("status error: {0}")]
    Status(String),

    /// Archive location or extraction error.
    #[error("extract error: {0}")]
    Extract(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, missing record key, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Another crawl run already holds the repository lock.
    #[error("another run is in progress (lock held at {path:?})")]
    RunInProgress { path: PathBuf },

    /// The run was cancelled cooperatively between records.
    #[error("run cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AlluviumError>;

impl AlluviumError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for conditions that must abort the whole run with no partial commit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Fetch(_))
    }
}
