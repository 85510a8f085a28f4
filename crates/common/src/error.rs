//! Error types for visreg

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the visreg Error
pub type Result<T> = std::result::Result<T, Error>;

/// visreg error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Baseline storage error for {key}: {reason}")]
    BaselineIo { key: String, reason: String },

    #[error("Capture driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Capture driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Invalid state transition for {key}: {from} -> {to}")]
    InvalidStateTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Application server error: {0}")]
    AppServer(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn baseline_io(key: impl ToString, reason: impl ToString) -> Self {
        Error::BaselineIo {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures reported by a browser capture driver for a single capture.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser crashed: {0}")]
    Crashed(String),

    #[error("transient driver error: {0}")]
    Transient(String),

    #[error("driver unavailable: {0}")]
    Unavailable(String),
}

impl DriverError {
    /// Whether a single retry is worthwhile.
    ///
    /// Every per-capture failure gets one more attempt; an unavailable driver
    /// cannot recover within a run.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DriverError::Unavailable(_))
    }
}
