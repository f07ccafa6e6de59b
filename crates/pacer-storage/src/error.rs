//! Storage error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Corrupt log {session_id} at chunk {sequence}: {reason}")]
    Corrupt {
        session_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("Log root {0} is locked by another process")]
    Locked(PathBuf),

    #[error("Session {0} is still being recorded")]
    SessionActive(String),

    #[error("Final flush of {session_id} failed ({pending_chunks} chunks not durable): {reason}")]
    FinalFlush {
        session_id: String,
        durable_index: u64,
        pending_chunks: usize,
        reason: String,
    },

    #[error("Session log worker is gone")]
    WorkerGone,
}

pub type StorageResult<T> = Result<T, StorageError>;
