//! Recorder error types

use pacer_core::SessionState;
use pacer_fit::EncodeError;
use pacer_metrics::MetricsError;
use pacer_storage::StorageError;
use pacer_upload::UploadError;
use std::fmt;
use thiserror::Error;

/// Commands accepted by the recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Prepare,
    Start,
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Prepare => "prepare",
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Session initialization failed: {0}")]
    Initialization(String),

    #[error("Cannot {command} while {from}")]
    InvalidTransition { from: SessionState, command: Command },

    /// The artifact was handed to the upload manager, but the log is not fully durable
    #[error("Final flush failed after upload hand-off (task {task_id:?}): {source}")]
    FinalFlush {
        task_id: Option<String>,
        #[source]
        source: StorageError,
    },

    #[error("Recording worker stopped unexpectedly")]
    WorkerGone,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

pub type RecorderResult<T> = Result<T, RecorderError>;
