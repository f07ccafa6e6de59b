//! Startup recovery of session logs
//!
//! For every session directory the latest parseable checkpoint decides the
//! outcome:
//! - no checkpoint: the log is empty
//! - final, or older than the staleness limit: orphaned, eligible for cleanup
//! - otherwise: resumable; chunks `1..=chunk_index` are loaded and verified
//!
//! Chunk files past the checkpoint and leftover temp files are deleted. A
//! missing or damaged chunk at or below the checkpoint is reported as corrupt.

use crate::atomic_writer::is_temp_file;
use crate::checkpoint::latest_checkpoint;
use crate::chunk_file::decode_chunk;
use crate::error::{StorageError, StorageResult};
use crate::file_lock::LOCK_FILE;
use crate::layout::{LogFile, SessionPaths};
use crate::session_log::ResumePoint;
use chrono::{DateTime, Duration, Utc};
use pacer_core::{Checkpoint, Chunk, LogEntry, MonotonicMs, SessionId, SessionManifest};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// A verified log: manifest, latest checkpoint and every durable chunk
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub manifest: SessionManifest,
    pub checkpoint: Checkpoint,
    pub chunks: Vec<Chunk>,
}

impl RecoveredSession {
    pub fn session_id(&self) -> &SessionId {
        &self.manifest.session_id
    }

    /// Every durable entry in ingestion order
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.chunks.iter().flat_map(|chunk| chunk.entries.iter())
    }

    pub fn last_timestamp(&self) -> Option<MonotonicMs> {
        self.entries().map(LogEntry::timestamp).max()
    }

    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            durable_index: self.checkpoint.chunk_index,
            last_digest: self.checkpoint.chunk_digest.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    Finalized,
    Stale,
}

#[derive(Debug, Clone)]
pub struct OrphanedLog {
    pub session_id: SessionId,
    pub checkpoint: Checkpoint,
    pub reason: OrphanReason,
}

#[derive(Debug)]
pub struct CorruptLog {
    pub session_id: SessionId,
    pub error: StorageError,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumable: Vec<RecoveredSession>,
    pub orphaned: Vec<OrphanedLog>,
    pub empty: Vec<SessionId>,
    pub corrupt: Vec<CorruptLog>,
    /// Temp files and chunks past their checkpoint that were deleted
    pub files_removed: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.resumable.is_empty() && self.corrupt.is_empty()
    }
}

pub fn read_manifest(paths: &SessionPaths) -> StorageResult<SessionManifest> {
    let data = fs::read(paths.manifest()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(format!("manifest in {}", paths.dir().display()))
        } else {
            StorageError::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&data)?)
}

fn corrupt(session_id: &SessionId, sequence: u64, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        session_id: session_id.to_string(),
        sequence,
        reason: reason.into(),
    }
}

/// Load and verify chunks `1..=checkpoint.chunk_index`
pub fn load_chunks(paths: &SessionPaths, checkpoint: &Checkpoint) -> StorageResult<Vec<Chunk>> {
    let session_id = &checkpoint.session_id;
    let mut chunks = Vec::with_capacity(checkpoint.chunk_index as usize);

    for sequence in 1..=checkpoint.chunk_index {
        let data = match fs::read(paths.chunk(sequence)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(corrupt(session_id, sequence, "chunk file missing"));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let (chunk, digest) =
            decode_chunk(&data).map_err(|e| corrupt(session_id, sequence, e.to_string()))?;
        if &chunk.session_id != session_id {
            return Err(corrupt(
                session_id,
                sequence,
                format!("chunk belongs to session {}", chunk.session_id),
            ));
        }
        if chunk.sequence != sequence {
            return Err(corrupt(
                session_id,
                sequence,
                format!("chunk carries sequence {}", chunk.sequence),
            ));
        }
        if sequence == checkpoint.chunk_index
            && let Some(expected) = &checkpoint.chunk_digest
            && expected != &digest
        {
            return Err(corrupt(session_id, sequence, "digest differs from checkpoint"));
        }

        chunks.push(chunk);
    }

    Ok(chunks)
}

/// Load a log in any state
pub fn load_session(root: &Path, session_id: &SessionId) -> StorageResult<RecoveredSession> {
    let paths = SessionPaths::new(root, session_id);
    if !paths.dir().is_dir() {
        return Err(StorageError::NotFound(format!("session log {}", session_id)));
    }
    let manifest = read_manifest(&paths)?;
    let checkpoint = latest_checkpoint(paths.dir())?
        .ok_or_else(|| StorageError::NotFound(format!("checkpoint for {}", session_id)))?;
    let chunks = load_chunks(&paths, &checkpoint)?;
    Ok(RecoveredSession {
        manifest,
        checkpoint,
        chunks,
    })
}

/// Delete temp files and chunks past `index`
fn remove_debris(dir: &Path, index: u64) -> StorageResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let past_checkpoint = matches!(
            path.file_name().and_then(|n| n.to_str()).and_then(LogFile::parse),
            Some(LogFile::Chunk(sequence)) if sequence > index
        );
        if is_temp_file(&path) || past_checkpoint {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

enum Outcome {
    Resumable(RecoveredSession),
    Orphaned(OrphanedLog),
    Empty,
}

fn classify(
    root: &Path,
    session_id: &SessionId,
    stale_after: Duration,
    now: DateTime<Utc>,
    report: &mut RecoveryReport,
) -> StorageResult<Outcome> {
    let paths = SessionPaths::new(root, session_id);

    let Some(checkpoint) = latest_checkpoint(paths.dir())? else {
        report.files_removed += remove_debris(paths.dir(), 0)?;
        return Ok(Outcome::Empty);
    };
    report.files_removed += remove_debris(paths.dir(), checkpoint.chunk_index)?;

    if checkpoint.is_final {
        return Ok(Outcome::Orphaned(OrphanedLog {
            session_id: session_id.clone(),
            checkpoint,
            reason: OrphanReason::Finalized,
        }));
    }
    if now.signed_duration_since(checkpoint.created_at) > stale_after {
        return Ok(Outcome::Orphaned(OrphanedLog {
            session_id: session_id.clone(),
            checkpoint,
            reason: OrphanReason::Stale,
        }));
    }

    let manifest = read_manifest(&paths)?;
    let chunks = load_chunks(&paths, &checkpoint)?;
    Ok(Outcome::Resumable(RecoveredSession {
        manifest,
        checkpoint,
        chunks,
    }))
}

/// Scan every session directory under `root`
pub fn recover(
    root: &Path,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> StorageResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    if !root.exists() {
        return Ok(report);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str().filter(|n| *n != LOCK_FILE) else {
            continue;
        };
        let session_id = match SessionId::parse(name) {
            Ok(id) => id,
            Err(e) => {
                warn!(directory = name, error = %e, "Ignoring foreign directory in log root");
                continue;
            }
        };

        match classify(root, &session_id, stale_after, now, &mut report) {
            Ok(Outcome::Resumable(session)) => report.resumable.push(session),
            Ok(Outcome::Orphaned(orphan)) => report.orphaned.push(orphan),
            Ok(Outcome::Empty) => report.empty.push(session_id),
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "Session log is corrupt");
                report.corrupt.push(CorruptLog { session_id, error });
            }
        }
    }

    info!(
        resumable = report.resumable.len(),
        orphaned = report.orphaned.len(),
        empty = report.empty.len(),
        corrupt = report.corrupt.len(),
        files_removed = report.files_removed,
        "Log recovery complete"
    );
    Ok(report)
}
