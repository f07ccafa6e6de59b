//! Error types for the upload manager

use crate::task::UploadState;
use pacer_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload task not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} task {task_id} in state {state}")]
    InvalidState {
        task_id: String,
        state: UploadState,
        action: &'static str,
    },

    #[error("Upload task {0} is already being attempted")]
    InFlight(String),

    #[error("Session {0} already has an unresolved upload")]
    Duplicate(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Outcome of a failed `put`, as classified by the object store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PutError {
    #[error("Retryable upload error: {message}")]
    Retryable {
        message: String,
        /// Server-requested delay before the next attempt
        retry_after: Option<Duration>,
    },

    #[error("Permanent upload error: {message}")]
    Permanent { message: String },
}

impl PutError {
    pub fn retryable(message: impl Into<String>) -> Self {
        PutError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PutError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PutError::Retryable { .. })
    }
}
