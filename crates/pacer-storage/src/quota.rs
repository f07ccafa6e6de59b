//! Storage quota enforcement
//!
//! Keeps logs plus upload artifacts under a byte budget by deleting the
//! oldest data that is safe to lose: artifacts of resolved uploads and final
//! logs no unresolved upload refers to. Active logs and dead-letter data are
//! never touched, even if that leaves the store over quota.

use crate::error::StorageResult;
use crate::store::DurableLogStore;
use chrono::{DateTime, Utc};
use pacer_core::SessionId;
use pacer_core::config::QuotaConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// What the upload side knows about which data is still needed
pub trait RetentionIndex: Send + Sync {
    /// Local artifacts whose upload is resolved
    fn resolved_artifacts(&self) -> Vec<PathBuf>;

    /// Whether a session's log must be kept (an unresolved task refers to it)
    fn is_protected(&self, session_id: &SessionId) -> bool;
}

/// Statistics about one enforcement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaStats {
    pub usage_before: u64,
    pub bytes_freed: u64,
    pub logs_deleted: usize,
    pub artifacts_deleted: usize,
    /// Still over budget after deleting everything eligible
    pub over_quota: bool,
}

/// Total size of the files below `path`
pub fn dir_size(path: &Path) -> StorageResult<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

enum Candidate {
    Artifact { path: PathBuf, bytes: u64 },
    Log { session_id: SessionId, bytes: u64 },
}

impl DurableLogStore {
    /// Delete eligible data, oldest first, until usage fits `max_total_bytes`
    pub fn enforce_quota(
        &self,
        max_total_bytes: u64,
        extra_dirs: &[PathBuf],
        index: &dyn RetentionIndex,
    ) -> StorageResult<QuotaStats> {
        let mut usage = self.disk_usage()?;
        for dir in extra_dirs {
            usage += dir_size(dir)?;
        }
        let mut stats = QuotaStats {
            usage_before: usage,
            ..QuotaStats::default()
        };
        if usage <= max_total_bytes {
            return Ok(stats);
        }

        let mut candidates: Vec<(DateTime<Utc>, Candidate)> = Vec::new();
        for path in index.resolved_artifacts() {
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            candidates.push((
                modified,
                Candidate::Artifact {
                    path,
                    bytes: metadata.len(),
                },
            ));
        }
        for log in self.list_logs()? {
            let Some(latest) = log.latest.as_ref().filter(|c| c.is_final) else {
                continue;
            };
            if self.is_active(&log.session_id) || index.is_protected(&log.session_id) {
                continue;
            }
            candidates.push((
                latest.created_at,
                Candidate::Log {
                    session_id: log.session_id.clone(),
                    bytes: log.bytes,
                },
            ));
        }
        candidates.sort_by_key(|(at, _)| *at);

        for (_, candidate) in candidates {
            if usage <= max_total_bytes {
                break;
            }
            let freed = match candidate {
                Candidate::Artifact { path, bytes } => match fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), bytes, "Quota deleted resolved artifact");
                        stats.artifacts_deleted += 1;
                        bytes
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Removed by the upload manager since the scan
                        tracing::debug!(path = %path.display(), "Resolved artifact already gone");
                        usage = usage.saturating_sub(bytes);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
                Candidate::Log { session_id, .. } => {
                    let bytes = self.purge(&session_id)?;
                    stats.logs_deleted += 1;
                    bytes
                }
            };
            usage = usage.saturating_sub(freed);
            stats.bytes_freed += freed;
        }

        stats.over_quota = usage > max_total_bytes;
        if let Some(metrics) = self.metrics() {
            metrics.record_quota_freed(stats.bytes_freed);
        }
        if stats.over_quota {
            tracing::warn!(
                usage,
                max_total_bytes,
                "Storage still over quota; remaining data is active or awaiting upload"
            );
        }
        Ok(stats)
    }
}

/// Handle for the background quota task
pub struct QuotaTask {
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl QuotaTask {
    /// Signal the quota task to shutdown gracefully
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

/// Spawn a task enforcing the quota every `interval_secs`
///
/// Returns `None` when no byte limit is configured.
pub fn spawn_quota_task(
    store: Arc<DurableLogStore>,
    config: QuotaConfig,
    extra_dirs: Vec<PathBuf>,
    index: Arc<dyn RetentionIndex>,
) -> Option<QuotaTask> {
    let max_total_bytes = config.max_total_bytes?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let interval = Duration::from_secs(config.interval_secs.max(1));

        tracing::info!(
            root = %store.root().display(),
            max_total_bytes,
            interval_secs = config.interval_secs,
            "Starting quota task"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Quota task shutting down");
                    break;
                }
                _ = sleep(interval) => {
                    match store.enforce_quota(max_total_bytes, &extra_dirs, index.as_ref()) {
                        Ok(stats) => {
                            if stats.bytes_freed > 0 {
                                tracing::info!(
                                    bytes_freed = stats.bytes_freed,
                                    logs_deleted = stats.logs_deleted,
                                    artifacts_deleted = stats.artifacts_deleted,
                                    "Quota cycle"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!("Quota task failed: {}", e);
                        }
                    }
                }
            }
        }
    });

    Some(QuotaTask {
        shutdown_tx,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_size_is_recursive() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(temp_dir.path()).unwrap(), 150);
        assert_eq!(dir_size(&temp_dir.path().join("missing")).unwrap(), 0);
    }
}
