//! Pipeline facade
//!
//! Owns the long-lived services shared by every recording: the durable log
//! store, the upload manager with its scheduler, and the quota task. Opening
//! the pipeline runs log recovery before any recorder can exist.

use crate::error::{RecorderError, RecorderResult};
use crate::recorder::{Recorder, RecorderContext};
use crate::replay::rebuild_artifact;
use pacer_core::{Clock, PipelineConfig, SystemClock};
use pacer_observability::PipelineMetrics;
use pacer_storage::{
    DurableLogStore, OrphanReason, QuotaTask, RecoveredSession, RecoveryReport, RetentionIndex,
    spawn_quota_task,
};
use pacer_upload::{
    ObjectStore, SchedulerTask, UploadManager, UploadRequest, UploadTask, spawn_scheduler,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Arc<DurableLogStore>,
    uploads: Arc<UploadManager>,
    metrics: PipelineMetrics,
    clock: Arc<dyn Clock>,
    connectivity_tx: watch::Sender<bool>,
    scheduler: SchedulerTask,
    quota: Option<QuotaTask>,
}

impl Pipeline {
    pub async fn open(
        config: PipelineConfig,
        object_store: Arc<dyn ObjectStore>,
    ) -> RecorderResult<(Self, RecoveryReport)> {
        Self::open_with_clock(config, object_store, Arc::new(SystemClock::new())).await
    }

    /// Open with an explicit clock for recorder timestamps
    ///
    /// Resumable sessions are returned in the report untouched; pass them to
    /// [`Pipeline::salvage`] to turn them into uploads.
    pub async fn open_with_clock(
        config: PipelineConfig,
        object_store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> RecorderResult<(Self, RecoveryReport)> {
        config
            .validate()
            .map_err(|e| RecorderError::Config(e.to_string()))?;
        let metrics = PipelineMetrics::new()
            .map_err(|e| RecorderError::Initialization(format!("metrics registry: {e}")))?;
        let config = Arc::new(config);

        let (store, report) = DurableLogStore::open(&config.log.root, config.log.clone())?;
        let store = Arc::new(store.with_metrics(metrics.clone()));
        let uploads = Arc::new(
            UploadManager::open(config.upload.clone(), object_store)?.with_metrics(metrics.clone()),
        );

        let settle_config = config.clone();
        let settle_store = store.clone();
        let settle_uploads = Arc::downgrade(&uploads);
        let settle_metrics = metrics.clone();
        uploads.on_settlement(Arc::new(move |task: &UploadTask| {
            if !task.is_corrupt_dead_letter() {
                release_log(&settle_store, task);
            } else if let Some(uploads) = settle_uploads.upgrade() {
                repair_artifact(&settle_config, &settle_store, &uploads, &settle_metrics, task);
            }
        }));

        reconcile_orphans(&config, &store, &uploads, &metrics, &report);
        for corrupt in &report.corrupt {
            warn!(
                session_id = %corrupt.session_id,
                error = %corrupt.error,
                "Corrupt session log left in place"
            );
        }

        let (connectivity_tx, connectivity_rx) = watch::channel(true);
        let scheduler = spawn_scheduler(uploads.clone(), connectivity_rx);
        let index: Arc<dyn RetentionIndex> = uploads.clone();
        let quota = spawn_quota_task(
            store.clone(),
            config.quota.clone(),
            vec![config.upload.artifact_dir.clone()],
            index,
        );

        info!(
            resumable = report.resumable.len(),
            orphaned = report.orphaned.len(),
            corrupt = report.corrupt.len(),
            "Pipeline opened"
        );

        Ok((
            Self {
                config,
                store,
                uploads,
                metrics,
                clock,
                connectivity_tx,
                scheduler,
                quota,
            },
            report,
        ))
    }

    /// A fresh recorder in the `idle` state
    pub fn recorder(&self) -> Recorder {
        Recorder::new(RecorderContext {
            config: self.config.clone(),
            store: self.store.clone(),
            uploads: self.uploads.clone(),
            clock: self.clock.clone(),
            metrics: Some(self.metrics.clone()),
        })
    }

    /// Finish a session interrupted by a crash and hand it to the uploader
    pub fn salvage(&self, recovered: &RecoveredSession) -> RecorderResult<UploadTask> {
        let task = enqueue_rebuilt(
            &self.config,
            &self.store,
            &self.uploads,
            &self.metrics,
            recovered,
        )?;
        info!(
            session_id = %recovered.session_id(),
            task_id = %task.id,
            "Interrupted session salvaged"
        );
        Ok(task)
    }

    /// Report connectivity; `true` after `false` retries waiting uploads early
    pub fn set_online(&self, online: bool) {
        self.connectivity_tx.send_replace(online);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DurableLogStore> {
        &self.store
    }

    pub fn uploads(&self) -> &Arc<UploadManager> {
        &self.uploads
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Stop background tasks; recorders still attached keep their logs resumable
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        if let Some(quota) = self.quota {
            quota.shutdown().await;
        }
        info!("Pipeline shut down");
    }
}

/// Drop the log of a settled upload; it is no longer needed to rebuild anything
fn release_log(store: &DurableLogStore, task: &UploadTask) {
    match store.purge(&task.session_id) {
        Ok(bytes) => info!(
            task_id = %task.id,
            session_id = %task.session_id,
            state = %task.state,
            bytes,
            "Session log released after upload settled"
        ),
        Err(e) => warn!(
            task_id = %task.id,
            session_id = %task.session_id,
            error = %e,
            "Failed to purge session log"
        ),
    }
}

/// Rebuild an artifact that failed verification from its log and queue the
/// task again. The log is kept whatever the result.
fn repair_artifact(
    config: &PipelineConfig,
    store: &DurableLogStore,
    uploads: &UploadManager,
    metrics: &PipelineMetrics,
    task: &UploadTask,
) {
    if task.corrupt_attempts() > 1 {
        error!(
            task_id = %task.id,
            session_id = %task.session_id,
            "Rebuilt artifact failed verification again; log kept for manual recovery"
        );
        return;
    }

    let repaired = store
        .load(&task.session_id)
        .map_err(RecorderError::from)
        .and_then(|recovered| rebuild_artifact(&recovered, &config.metrics, &config.encoder))
        .and_then(|rebuilt| {
            metrics.record_artifact_encoded(rebuilt.artifact.size);
            uploads
                .replace_artifact(&task.id, rebuilt.artifact.bytes)
                .map_err(RecorderError::from)
        });
    match repaired {
        Ok(requeued) => warn!(
            task_id = %requeued.id,
            session_id = %requeued.session_id,
            size = requeued.size,
            "Corrupt artifact rebuilt from the session log"
        ),
        Err(e) => error!(
            task_id = %task.id,
            session_id = %task.session_id,
            error = %e,
            "Could not rebuild corrupt artifact; log kept"
        ),
    }
}

fn enqueue_rebuilt(
    config: &PipelineConfig,
    store: &DurableLogStore,
    uploads: &UploadManager,
    metrics: &PipelineMetrics,
    recovered: &RecoveredSession,
) -> RecorderResult<UploadTask> {
    let rebuilt = rebuild_artifact(recovered, &config.metrics, &config.encoder)?;
    if !recovered.checkpoint.is_final {
        store.seal(recovered)?;
    }
    metrics.record_artifact_encoded(rebuilt.artifact.size);
    let task = uploads.enqueue(UploadRequest::new(
        recovered.session_id().clone(),
        recovered.manifest.owner.clone(),
        rebuilt.artifact.bytes,
    ))?;
    if rebuilt.truncated {
        warn!(
            session_id = %recovered.session_id(),
            "Session log ended without a stop event; closed at its last entry"
        );
    }
    Ok(task)
}

/// Finalized logs nobody uploads are re-enqueued; stale ones are purged
fn reconcile_orphans(
    config: &PipelineConfig,
    store: &DurableLogStore,
    uploads: &UploadManager,
    metrics: &PipelineMetrics,
    report: &RecoveryReport,
) {
    for orphan in &report.orphaned {
        let session_id = &orphan.session_id;
        if uploads.is_protected(session_id) {
            continue;
        }
        match orphan.reason {
            OrphanReason::Finalized => {
                let result = store
                    .load(session_id)
                    .map_err(RecorderError::from)
                    .and_then(|recovered| {
                        enqueue_rebuilt(config, store, uploads, metrics, &recovered)
                    });
                match result {
                    Ok(task) => info!(
                        session_id = %session_id,
                        task_id = %task.id,
                        "Finalized session log without upload task re-enqueued"
                    ),
                    Err(e) => warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to re-enqueue finalized session log"
                    ),
                }
            }
            OrphanReason::Stale => match store.purge(session_id) {
                Ok(bytes) => info!(session_id = %session_id, bytes, "Stale session log purged"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to purge stale session log"),
            },
        }
    }
}
