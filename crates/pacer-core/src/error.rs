//! Error types for Pacer Core

use crate::reading::MetricKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid reading: {0}")]
    InvalidReading(#[from] InvalidReading),

    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    #[error("Profile unavailable: {0}")]
    Profile(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a reading was rejected as malformed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReading {
    #[error("{metric} value is not finite")]
    NonFinite { metric: MetricKind },

    #[error("{metric} value {value} outside [{min}, {max}]")]
    OutOfRange {
        metric: MetricKind,
        value: f64,
        min: f64,
        max: f64,
    },
}
