//! Error types for the sync layer
//!
//! This module defines all error types used throughout the crate.
//!
//! Only [`Error::InvalidInput`] is ever returned to callers of the local-first
//! write path. The remote-related variants are produced at the adapter and
//! handler boundaries and are absorbed by the queue or the merger.

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the sync layer
#[derive(Error, Debug)]
pub enum Error {
    /// Remote backend is not configured
    #[error("Remote adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Transient remote write failure
    #[error("Remote write failed for {scope}/{id}: {message}")]
    WriteFailed {
        /// Collection scope of the failed write
        scope: String,
        /// Record id of the failed write
        id: String,
        /// Error message
        message: String,
    },

    /// No replay handler registered for an action type
    #[error("No handler registered for action type '{0}'")]
    HandlerMissing(String),

    /// A live-query source reported an error
    #[error("Merge source '{source_key}' failed: {message}")]
    MergeSourceError {
        /// Key of the failing source
        source_key: String,
        /// Error message
        message: String,
    },

    /// Local mirror store errors
    #[error("Mirror store error: {0}")]
    MirrorStore(String),

    /// Durable action log errors
    #[error("Action log error: {0}")]
    ActionLog(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input (missing identifiers and similar programmer errors)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP or transport errors raised by remote adapters
    #[error("Transport error: {0}")]
    Transport(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an adapter-unavailable error
    pub fn adapter_unavailable(msg: impl Into<String>) -> Self {
        Self::AdapterUnavailable(msg.into())
    }

    /// Create a write-failed error
    pub fn write_failed(
        scope: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::WriteFailed {
            scope: scope.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a handler-missing error
    pub fn handler_missing(action_type: impl Into<String>) -> Self {
        Self::HandlerMissing(action_type.into())
    }

    /// Create a merge source error
    pub fn merge_source(source_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MergeSourceError {
            source_key: source_key.into(),
            message: message.into(),
        }
    }

    /// Create a mirror store error
    pub fn mirror_store(msg: impl Into<String>) -> Self {
        Self::MirrorStore(msg.into())
    }

    /// Create an action log error
    pub fn action_log(msg: impl Into<String>) -> Self {
        Self::ActionLog(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this error means the remote is simply not there
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::AdapterUnavailable(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Reject empty identifiers before any state is touched
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_input(format!("{} must not be empty", field)));
    }
    Ok(())
}
