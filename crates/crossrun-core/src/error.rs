//! Error types for the crossrun orchestration engine.
//!
//! Every failure the engine reports to a caller goes through
//! [`CrossrunError`]. Transport faults that occur mid-request are
//! deliberately *not* propagated as errors: the request sender converts
//! them into a synthetic aborted completion event so callers always
//! observe exactly one terminal callback per request.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for crossrun operations.
#[derive(Debug, Error)]
pub enum CrossrunError {
    /// A worker failed to connect back within the configured window.
    /// Fatal; never retried automatically.
    #[error("worker failed to connect within {timeout:?}")]
    ConnectionTimeout { timeout: Duration },

    /// The peer disappeared mid-exchange.
    #[error("channel fault: {message}")]
    ChannelFault { message: String },

    /// A session-pool worker failed to connect during session start.
    #[error("proxy setup failed for {}: {message}", source_path.display())]
    ProxySetupFailure {
        source_path: PathBuf,
        message: String,
    },

    /// Dequeue criteria matched no available pooled worker.
    /// Non-retryable; the pool never falls back to spawning.
    #[error("no available worker matches source {} with the given run settings", source_path.display())]
    SessionIdentityMismatch { source_path: PathBuf },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Double-enqueue, enqueue of an unknown id, and similar
    /// programming errors around pooled-worker ownership.
    #[error("ownership violation: {message}")]
    OwnershipViolation { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("worker launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("operation cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for crossrun operations.
pub type Result<T> = std::result::Result<T, CrossrunError>;

impl From<std::io::Error> for CrossrunError {
    fn from(err: std::io::Error) -> Self {
        CrossrunError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CrossrunError {
    fn from(err: serde_json::Error) -> Self {
        CrossrunError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CrossrunError {
    /// Create a channel fault from any source description.
    pub fn channel_fault(message: impl Into<String>) -> Self {
        CrossrunError::ChannelFault {
            message: message.into(),
        }
    }

    /// True for failures that abort the whole pipeline rather than a
    /// single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrossrunError::ConnectionTimeout { .. }
                | CrossrunError::ProxySetupFailure { .. }
                | CrossrunError::LaunchFailed { .. }
        )
    }
}
