//! The durable log store: one locked root holding every session log

use crate::atomic_writer::write_atomic;
use crate::checkpoint::{latest_checkpoint, write_checkpoint};
use crate::error::{StorageError, StorageResult};
use crate::file_lock::DirLock;
use crate::layout::SessionPaths;
use crate::quota::dir_size;
use crate::recovery::{OrphanedLog, RecoveredSession, RecoveryReport, load_session, recover};
use crate::session_log::{ActiveGuard, ResumePoint, SessionLog};
use crate::sink::FsChunkSink;
use chrono::{Duration, Utc};
use pacer_core::config::LogConfig;
use pacer_core::{Checkpoint, SessionId, SessionManifest};
use pacer_observability::PipelineMetrics;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Size and state of one log on disk
#[derive(Debug, Clone)]
pub struct LogSummary {
    pub session_id: SessionId,
    pub latest: Option<Checkpoint>,
    pub bytes: u64,
}

impl LogSummary {
    pub fn is_final(&self) -> bool {
        self.latest.as_ref().is_some_and(|c| c.is_final)
    }
}

pub struct DurableLogStore {
    root: PathBuf,
    config: LogConfig,
    active: Arc<Mutex<HashSet<SessionId>>>,
    metrics: Option<PipelineMetrics>,
    _lock: DirLock,
}

impl DurableLogStore {
    /// Lock `root` and run recovery before any session can be created
    pub fn open<P: AsRef<Path>>(
        root: P,
        config: LogConfig,
    ) -> StorageResult<(Self, RecoveryReport)> {
        let root = root.as_ref().to_path_buf();
        let lock = DirLock::try_acquire(&root)?;

        let stale_after = Duration::seconds(i64::try_from(config.stale_after_secs).unwrap_or(i64::MAX));
        let report = recover(&root, stale_after, Utc::now())?;

        info!(root = %root.display(), "Durable log store opened");
        Ok((
            Self {
                root,
                config,
                active: Arc::new(Mutex::new(HashSet::new())),
                metrics: None,
                _lock: lock,
            },
            report,
        ))
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.active
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(true)
    }

    fn paths(&self, session_id: &SessionId) -> SessionPaths {
        SessionPaths::new(&self.root, session_id)
    }

    fn spawn_log(
        &self,
        session_id: &SessionId,
        resume: ResumePoint,
    ) -> StorageResult<SessionLog> {
        let guard = ActiveGuard::register(Arc::clone(&self.active), session_id.clone())
            .ok_or_else(|| StorageError::SessionActive(session_id.to_string()))?;
        let sink = Arc::new(FsChunkSink::new(self.paths(session_id)));
        Ok(SessionLog::spawn(
            session_id.clone(),
            sink,
            &self.config,
            resume,
            self.metrics.clone(),
            Some(guard),
        ))
    }

    /// Create the log of a new session. Must be called inside a tokio runtime.
    pub fn create_session(&self, manifest: &SessionManifest) -> StorageResult<SessionLog> {
        let paths = self.paths(&manifest.session_id);
        if paths.manifest().exists() {
            return Err(StorageError::InvalidData(format!(
                "session log {} already exists",
                manifest.session_id
            )));
        }

        write_atomic(paths.manifest(), &serde_json::to_vec_pretty(manifest)?)?;
        let log = self.spawn_log(&manifest.session_id, ResumePoint::default())?;

        info!(session_id = %manifest.session_id, owner = %manifest.owner, "Session log created");
        Ok(log)
    }

    /// Continue a recovered log at the next sequence
    pub fn reopen(&self, recovered: &RecoveredSession) -> StorageResult<SessionLog> {
        if recovered.checkpoint.is_final {
            return Err(StorageError::InvalidData(format!(
                "session log {} is already final",
                recovered.session_id()
            )));
        }
        let log = self.spawn_log(recovered.session_id(), recovered.resume_point())?;
        info!(
            session_id = %recovered.session_id(),
            chunk_index = recovered.checkpoint.chunk_index,
            "Session log reopened"
        );
        Ok(log)
    }

    /// Write the final checkpoint of a recovered log without reopening it
    pub fn seal(&self, recovered: &RecoveredSession) -> StorageResult<Checkpoint> {
        if self.is_active(recovered.session_id()) {
            return Err(StorageError::SessionActive(recovered.session_id().to_string()));
        }
        let checkpoint = Checkpoint {
            is_final: true,
            created_at: Utc::now(),
            ..recovered.checkpoint.clone()
        };
        write_checkpoint(&self.paths(recovered.session_id()), &checkpoint)?;
        Ok(checkpoint)
    }

    /// Load and verify a log in any state
    pub fn load(&self, session_id: &SessionId) -> StorageResult<RecoveredSession> {
        load_session(&self.root, session_id)
    }

    /// Delete a session's log; refused while it is being recorded
    pub fn purge(&self, session_id: &SessionId) -> StorageResult<u64> {
        if self.is_active(session_id) {
            return Err(StorageError::SessionActive(session_id.to_string()));
        }
        let paths = self.paths(session_id);
        if !paths.dir().exists() {
            return Ok(0);
        }
        let bytes = dir_size(paths.dir())?;
        fs::remove_dir_all(paths.dir())?;
        info!(session_id = %session_id, bytes, "Session log purged");
        Ok(bytes)
    }

    pub fn purge_orphans(&self, orphans: &[OrphanedLog]) -> StorageResult<u64> {
        let mut freed = 0;
        for orphan in orphans {
            freed += self.purge(&orphan.session_id)?;
        }
        Ok(freed)
    }

    pub fn list_logs(&self) -> StorageResult<Vec<LogSummary>> {
        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(session_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| SessionId::parse(name).ok())
            else {
                continue;
            };
            logs.push(LogSummary {
                latest: latest_checkpoint(&entry.path())?,
                bytes: dir_size(&entry.path())?,
                session_id,
            });
        }
        logs.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(logs)
    }

    /// Bytes used by every log under the root
    pub fn disk_usage(&self) -> StorageResult<u64> {
        dir_size(&self.root)
    }

    pub(crate) fn metrics(&self) -> Option<&PipelineMetrics> {
        self.metrics.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::{ClockOrigin, ProfileSnapshot, Reading};
    use tempfile::TempDir;

    fn manifest() -> SessionManifest {
        SessionManifest {
            session_id: SessionId::generate(),
            owner: "athlete-1".to_string(),
            created_at: Utc::now(),
            clock_origin: ClockOrigin::new(Utc::now(), 0),
            profile: ProfileSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_root_cannot_be_opened_twice() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, report) =
            DurableLogStore::open(temp_dir.path(), LogConfig::default()).unwrap();
        assert!(report.is_clean());

        let second = DurableLogStore::open(temp_dir.path(), LogConfig::default());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[tokio::test]
    async fn test_active_session_cannot_be_purged() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = DurableLogStore::open(temp_dir.path(), LogConfig::default()).unwrap();
        let manifest = manifest();

        let mut log = store.create_session(&manifest).unwrap();
        log.append(Reading::power(0, 100.0).into());
        assert!(matches!(
            store.purge(&manifest.session_id),
            Err(StorageError::SessionActive(_))
        ));
        assert!(store.create_session(&manifest).is_err());

        log.finish().await.unwrap();
        assert!(!store.is_active(&manifest.session_id));
        assert!(store.purge(&manifest.session_id).unwrap() > 0);
        assert!(store.list_logs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_session_stays_active_after_finish() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = DurableLogStore::open(temp_dir.path(), LogConfig::default()).unwrap();
        let manifest = manifest();

        let mut log = store.create_session(&manifest).unwrap();
        log.append(Reading::power(0, 100.0).into());
        let hold = log.hold();
        assert!(hold.is_some());
        log.finish().await.unwrap();

        assert!(store.is_active(&manifest.session_id));
        assert!(matches!(
            store.purge(&manifest.session_id),
            Err(StorageError::SessionActive(_))
        ));

        drop(hold);
        assert!(!store.is_active(&manifest.session_id));
        assert!(store.purge(&manifest.session_id).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_finished_log_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = DurableLogStore::open(temp_dir.path(), LogConfig::default()).unwrap();
        let manifest = manifest();

        let mut log = store.create_session(&manifest).unwrap();
        for s in 0..5u64 {
            log.append(Reading::speed(s * 1000, 8.5).into());
        }
        log.flush();
        log.append(Reading::speed(5000, 9.0).into());
        let report = log.finish().await.unwrap();
        assert_eq!(report.chunk_index, 2);

        let loaded = store.load(&manifest.session_id).unwrap();
        assert!(loaded.checkpoint.is_final);
        assert_eq!(loaded.entries().count(), 6);
        assert_eq!(loaded.manifest, manifest);

        let logs = store.list_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_final());
    }
}
