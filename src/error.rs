//! Error types for feed ingestion and replay.
//!
//! All fallible operations in the crate return [`Result`]. The error taxonomy
//! mirrors the failure classes of the feed pipeline:
//!
//! - **Negotiation errors**: the HTTP handshake that precedes the socket
//! - **Socket errors**: the persistent push-feed connection
//! - **Decode errors**: malformed compressed sub-payloads (non-fatal; the
//!   offending message is dropped by the caller)
//! - **File errors**: replay file access
//! - **Parse errors**: unexpected wire or payload structure
//!
//! Per-message faults inside the producer and consumer loops are never allowed
//! to escape the loop; they are logged and the next message is processed.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for feed operations.
pub type Result<T, E = FeedError> = std::result::Result<T, E>;

/// Main error type for feed operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FeedError {
    #[error("negotiation failed: {reason}")]
    Negotiation {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("socket error: {reason}")]
    Socket {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("replay file error: {}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("invalid replay speed: {value}")]
    InvalidSpeed { value: f64 },

    #[error("session is already running a producer")]
    AlreadyRunning,
}

impl FeedError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Negotiation { .. } => true,
            FeedError::Socket { .. } => true,
            FeedError::Decode { .. } => false,
            FeedError::File { .. } => false,
            FeedError::Parse { .. } => false,
            FeedError::InvalidSpeed { .. } => false,
            FeedError::AlreadyRunning => false,
        }
    }

    /// Helper constructor for negotiation failures.
    pub fn negotiation_failed(reason: impl Into<String>) -> Self {
        FeedError::Negotiation { reason: reason.into(), source: None }
    }

    /// Helper constructor for negotiation failures with an underlying cause.
    pub fn negotiation_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        FeedError::Negotiation { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for socket failures.
    pub fn socket_error(reason: impl Into<String>) -> Self {
        FeedError::Socket { reason: reason.into(), source: None }
    }

    /// Helper constructor for socket failures with an underlying cause.
    pub fn socket_error_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        FeedError::Socket { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for sub-payload decode failures.
    pub fn decode_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        FeedError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for replay file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        FeedError::File { path, source }
    }

    /// Helper constructor for wire/payload parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        FeedError::Parse { context: context.into(), details: details.into() }
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse { context: "json".to_string(), details: err.to_string() }
    }
}
