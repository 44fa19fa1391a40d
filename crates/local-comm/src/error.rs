//! Error types for local-comm.
//!
//! Every failure a caller or endpoint can observe is a [`LocalCommError`].
//! The variants are fine-grained for diagnostics; [`LocalCommError::category`]
//! folds them onto the four phases a caller cares about.

use std::time::Duration;
use thiserror::Error;

/// Main error type for local-comm.
#[derive(Debug, Error)]
pub enum LocalCommError {
    // Discovery errors
    #[error("service '{service}' not available (connect timeout {timeout:?})")]
    ServiceUnavailable { service: String, timeout: Duration },

    // Peer-reported errors
    #[error("{service}: {message}")]
    Server { service: String, message: String },

    // Registration errors
    #[error("Registration error: {message}")]
    Registration { message: String },

    // Transport errors
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed control message: {message}")]
    MalformedMessage { message: String },

    #[error("I/O timed out after {0:?}")]
    Timeout(Duration),

    // Segment errors
    #[error("Shared memory segment not found: {name}")]
    SegmentNotFound { name: String },

    #[error("Shared memory segment {name}: {message}")]
    Segment {
        name: String,
        message: String,
        #[source]
        source: Option<nix::Error>,
    },

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
}

/// Result type alias for local-comm operations.
pub type Result<T> = std::result::Result<T, LocalCommError>;

/// The phase of a call or registration in which an error arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The service could not be reached before the connect deadline.
    Discovery,
    /// The peer answered with an explicit failure.
    Server,
    /// Framing, socket or local segment failure.
    Transport,
    /// Duplicate or missing registrations.
    Registration,
}

impl From<std::io::Error> for LocalCommError {
    fn from(err: std::io::Error) -> Self {
        LocalCommError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LocalCommError {
    fn from(err: serde_json::Error) -> Self {
        LocalCommError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl LocalCommError {
    /// Create a segment error from an OS error.
    pub fn segment(name: impl Into<String>, message: impl Into<String>, err: nix::Error) -> Self {
        LocalCommError::Segment {
            name: name.into(),
            message: message.into(),
            source: Some(err),
        }
    }

    /// Create a malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        LocalCommError::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create a registration error.
    pub fn registration(message: impl Into<String>) -> Self {
        LocalCommError::Registration {
            message: message.into(),
        }
    }

    /// Map this error onto the phase it belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LocalCommError::ServiceUnavailable { .. } => ErrorCategory::Discovery,
            LocalCommError::Server { .. } => ErrorCategory::Server,
            LocalCommError::Registration { .. } => ErrorCategory::Registration,

            LocalCommError::ConnectionClosed
            | LocalCommError::MalformedMessage { .. }
            | LocalCommError::Timeout(_)
            | LocalCommError::SegmentNotFound { .. }
            | LocalCommError::Segment { .. }
            | LocalCommError::Io { .. }
            | LocalCommError::Json { .. } => ErrorCategory::Transport,
        }
    }

    /// Whether this is a generic communication failure.
    pub fn is_comm_error(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }
}
