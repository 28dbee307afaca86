//! Error types for streaming sessions.
//!
//! Every failure in the crate is a [`StreamError`]. Errors carry enough context
//! (source id, viewer id, reason) to be logged directly, and map onto a small
//! copyable [`ErrorKind`] that is what viewers actually receive.
//!
//! ## Error Categories
//!
//! - **Lookup Errors**: unknown source ids, unknown or already terminated sessions
//! - **Source Errors**: transient disconnects and timeouts (retried inside the adapter)
//!   and terminal unavailability (propagated to every subscribed session)
//! - **Configuration Errors**: invalid source records, invalid rates, unreadable config
//! - **Transport Errors**: the viewer's channel has gone away
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use framecast::{ErrorKind, StreamError};
//!
//! let error = StreamError::disconnected("cam1", "socket reset");
//! assert!(error.is_retryable());
//! assert_eq!(error.kind(), ErrorKind::SourceDisconnected);
//!
//! let error = StreamError::source_unavailable("cam1", "reconnection attempts exhausted");
//! assert!(!error.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Source '{source_id}' not found")]
    SourceNotFound { source_id: String },

    #[error("Source '{source_id}' unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("Source '{source_id}' disconnected: {reason}")]
    SourceDisconnected { source_id: String, reason: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Invalid configuration for source '{source_id}': {reason}")]
    InvalidConfig { source_id: String, reason: String },

    #[error("No active session for viewer '{viewer_id}' on source '{source_id}'")]
    SessionNotFound { viewer_id: String, source_id: String },

    #[error("Invalid frame rate: {requested}")]
    InvalidRate { requested: u32 },

    #[error("Transport closed for viewer '{viewer_id}'")]
    TransportClosed { viewer_id: String },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("I/O error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Wire-level error classification delivered to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceNotFound,
    SourceUnavailable,
    SourceDisconnected,
    Timeout,
    InvalidConfig,
    SessionNotFound,
    InvalidRate,
    TransportClosed,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SourceNotFound => "source_not_found",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SourceDisconnected => "source_disconnected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::InvalidRate => "invalid_rate",
            ErrorKind::TransportClosed => "transport_closed",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl StreamError {
    /// Returns whether this error is recovered by reconnecting to the source.
    ///
    /// Only transient source failures are retryable. They are handled inside
    /// the frame source adapter and never reach a session.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::SourceDisconnected { .. } => true,
            StreamError::Timeout { .. } => true,
            StreamError::SourceNotFound { .. } => false,
            StreamError::SourceUnavailable { .. } => false,
            StreamError::InvalidConfig { .. } => false,
            StreamError::SessionNotFound { .. } => false,
            StreamError::InvalidRate { .. } => false,
            StreamError::TransportClosed { .. } => false,
            StreamError::Config { .. } => false,
            StreamError::Io { .. } => false,
        }
    }

    /// Returns the classification reported to viewers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::SourceNotFound { .. } => ErrorKind::SourceNotFound,
            StreamError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            StreamError::SourceDisconnected { .. } => ErrorKind::SourceDisconnected,
            StreamError::Timeout { .. } => ErrorKind::Timeout,
            StreamError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            StreamError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            StreamError::InvalidRate { .. } => ErrorKind::InvalidRate,
            StreamError::TransportClosed { .. } => ErrorKind::TransportClosed,
            StreamError::Config { .. } | StreamError::Io { .. } => ErrorKind::Internal,
        }
    }

    /// Helper constructor for unknown source ids.
    pub fn source_not_found(source_id: impl Into<String>) -> Self {
        StreamError::SourceNotFound { source_id: source_id.into() }
    }

    /// Helper constructor for terminal source failures.
    pub fn source_unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::SourceUnavailable { source_id: source_id.into(), reason: reason.into() }
    }

    /// Helper constructor for transient source failures.
    pub fn disconnected(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::SourceDisconnected { source_id: source_id.into(), reason: reason.into() }
    }

    /// Helper constructor for invalid source records.
    pub fn invalid_config(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::InvalidConfig { source_id: source_id.into(), reason: reason.into() }
    }

    /// Helper constructor for commands referencing a missing session.
    pub fn session_not_found(viewer_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        StreamError::SessionNotFound { viewer_id: viewer_id.into(), source_id: source_id.into() }
    }

    /// Helper constructor for closed viewer channels.
    pub fn transport_closed(viewer_id: impl Into<String>) -> Self {
        StreamError::TransportClosed { viewer_id: viewer_id.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        StreamError::Config { details: details.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::Io { path: path.into(), source }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_yaml_ng::Error> for StreamError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        StreamError::Config { details: err.to_string() }
    }
}
