//! Checkpoint files

use crate::atomic_writer::write_atomic;
use crate::error::{StorageError, StorageResult};
use crate::layout::{LogFile, SessionPaths};
use pacer_core::Checkpoint;
use std::fs;
use std::path::Path;
use tracing::warn;

pub fn write_checkpoint(paths: &SessionPaths, checkpoint: &Checkpoint) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(checkpoint)?;
    write_atomic(
        paths.checkpoint(checkpoint.chunk_index, checkpoint.is_final),
        &json,
    )
}

/// Every parseable checkpoint of a session, oldest first
///
/// Unparseable checkpoint files are skipped so a torn write can never hide an
/// older valid checkpoint.
pub fn read_checkpoints(dir: &Path) -> StorageResult<Vec<Checkpoint>> {
    let mut checkpoints = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(LogFile::Checkpoint { .. }) = name.to_str().and_then(LogFile::parse) else {
            continue;
        };

        let parsed = fs::read(entry.path())
            .map_err(StorageError::from)
            .and_then(|data| serde_json::from_slice::<Checkpoint>(&data).map_err(Into::into));
        match parsed {
            Ok(checkpoint) => checkpoints.push(checkpoint),
            Err(e) => warn!(
                path = %entry.path().display(),
                error = %e,
                "Skipping unreadable checkpoint"
            ),
        }
    }

    checkpoints.sort_by_key(|c| (c.chunk_index, c.is_final));
    Ok(checkpoints)
}

/// The most recent parseable checkpoint
pub fn latest_checkpoint(dir: &Path) -> StorageResult<Option<Checkpoint>> {
    Ok(read_checkpoints(dir)?.pop())
}
