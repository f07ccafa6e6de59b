//! Recording orchestrator
//!
//! One [`Recorder`] per recording. It walks the session through
//! `idle → pending → ready → recording ⇄ paused → finished` and owns the
//! handles of everything attached to it: the ingress, the consumer task and,
//! through the consumer, the metrics engine, the session log and the encoder.

use crate::consumer::{Consumed, ConsumerSettings, spawn_consumer};
use crate::error::{Command, RecorderError, RecorderResult};
use crate::ingress::{Ingested, Ingress, IngressStats, Phase};
use crate::replay::rebuild_artifact;
use pacer_core::{
    Clock, ClockOrigin, LogEntry, PipelineConfig, ProfileProvider, Session, SessionId,
    SessionManifest, SessionState, TimerAction, TimerEvent,
};
use pacer_fit::{EncodeError, FitArtifact, FitEncoder};
use pacer_metrics::{LiveMetrics, MetricsEngine, MetricsSnapshot};
use pacer_observability::PipelineMetrics;
use pacer_storage::{DurableLogStore, FinalFlushReport, LogStatus};
use pacer_upload::{UploadManager, UploadRequest, UploadTask};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared services a recorder is attached to
#[derive(Clone)]
pub(crate) struct RecorderContext {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<DurableLogStore>,
    pub uploads: Arc<UploadManager>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<PipelineMetrics>,
}

/// What a completed recording produced
#[derive(Debug, Clone)]
pub struct StopReport {
    pub session_id: SessionId,
    pub summary: MetricsSnapshot,
    pub artifact_size: usize,
    pub records: u64,
    pub task: UploadTask,
    pub flush: FinalFlushReport,
}

struct Attached {
    session: Session,
    ingress: Ingress,
    consumer: JoinHandle<()>,
    readings_count: Arc<AtomicU64>,
    status: watch::Receiver<LogStatus>,
}

pub struct Recorder {
    context: RecorderContext,
    state: SessionState,
    attached: Option<Attached>,
    finished: Option<Session>,
    live_tx: watch::Sender<LiveMetrics>,
}

impl Recorder {
    pub(crate) fn new(context: RecorderContext) -> Self {
        let (live_tx, _) = watch::channel(LiveMetrics::default());
        Self {
            context,
            state: SessionState::Idle,
            attached: None,
            finished: None,
            live_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current view of the session, if one was prepared
    pub fn session(&self) -> Option<Session> {
        if let Some(attached) = &self.attached {
            let mut session = attached.session.clone();
            session.state = self.state;
            session.readings_count = attached.readings_count.load(Ordering::Relaxed);
            session.chunk_index = attached.status.borrow().durable_index;
            return Some(session);
        }
        self.finished.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(|s| s.id)
    }

    /// Push handle for sensor callbacks; available once prepared
    pub fn ingress(&self) -> Option<Ingress> {
        self.attached.as_ref().map(|a| a.ingress.clone())
    }

    pub fn stats(&self) -> Option<IngressStats> {
        self.attached.as_ref().map(|a| a.ingress.stats())
    }

    /// Live metrics, refreshed on the live timer while a session is attached
    pub fn live(&self) -> watch::Receiver<LiveMetrics> {
        self.live_tx.subscribe()
    }

    /// Log status, including degraded mode, while a session is attached
    pub fn warnings(&self) -> Option<watch::Receiver<LogStatus>> {
        self.attached.as_ref().map(|a| a.status.clone())
    }

    fn check(&self, command: Command, allowed: &[SessionState]) -> RecorderResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RecorderError::InvalidTransition {
                from: self.state,
                command,
            })
        }
    }

    /// Load the profile once and create the session log
    pub async fn prepare(
        &mut self,
        owner: &str,
        profile_provider: &dyn ProfileProvider,
    ) -> RecorderResult<SessionId> {
        self.check(Command::Prepare, &[SessionState::Idle])?;
        self.state = SessionState::Pending;

        match self.attach(owner, profile_provider).await {
            Ok(attached) => {
                let session_id = attached.session.id.clone();
                info!(session_id = %session_id, owner, "Session ready");
                self.attached = Some(attached);
                self.state = SessionState::Ready;
                Ok(session_id)
            }
            Err(reason) => {
                error!(owner, error = %reason, "Session initialization failed");
                self.state = SessionState::Idle;
                Err(RecorderError::Initialization(reason))
            }
        }
    }

    async fn attach(
        &self,
        owner: &str,
        profile_provider: &dyn ProfileProvider,
    ) -> Result<Attached, String> {
        let context = &self.context;
        let profile = profile_provider
            .load_profile(owner)
            .await
            .map_err(|e| e.to_string())?;

        let origin = ClockOrigin::new(context.clock.now_utc(), context.clock.now_ms());
        let manifest = SessionManifest {
            session_id: SessionId::generate(),
            owner: owner.to_string(),
            created_at: origin.wall,
            clock_origin: origin,
            profile,
        };
        let log = context
            .store
            .create_session(&manifest)
            .map_err(|e| e.to_string())?;
        let status = log.status();

        let config = &context.config;
        let (ingress, rx) = Ingress::new(config.ingress.clone(), context.metrics.clone());
        let readings_count = Arc::new(AtomicU64::new(0));
        let consumer = spawn_consumer(
            rx,
            Consumed {
                engine: MetricsEngine::new(profile, &config.metrics),
                log,
                encoder: FitEncoder::new(origin, &config.encoder),
                encode_error: None,
            },
            ConsumerSettings {
                flush_interval: Duration::from_millis(config.log.flush_interval_ms.max(1)),
                live_interval: Duration::from_millis(config.metrics.live_refresh_ms.max(1)),
            },
            context.clock.clone(),
            self.live_tx.clone(),
            readings_count.clone(),
        );

        Ok(Attached {
            session: Session::new(manifest.session_id, owner, profile),
            ingress,
            consumer,
            readings_count,
            status,
        })
    }

    fn attached(&self) -> RecorderResult<&Attached> {
        self.attached.as_ref().ok_or(RecorderError::WorkerGone)
    }

    async fn timer(&self, action: TimerAction) -> RecorderResult<u64> {
        let timestamp = self.context.clock.now_ms();
        let entry: LogEntry = TimerEvent::new(timestamp, action).into();
        if !self.attached()?.ingress.send(Ingested::Entry(entry)).await {
            return Err(RecorderError::WorkerGone);
        }
        Ok(timestamp)
    }

    pub async fn start(&mut self) -> RecorderResult<()> {
        self.check(Command::Start, &[SessionState::Ready])?;
        self.timer(TimerAction::Start).await?;
        let started_at = self.context.clock.now_utc();
        if let Some(attached) = self.attached.as_mut() {
            attached.session.started_at = Some(started_at);
            attached.ingress.set_phase(Phase::Recording);
        }
        self.state = SessionState::Recording;
        info!(session_id = ?self.session_id(), "Recording started");
        Ok(())
    }

    /// Readings arriving while paused are discarded
    pub async fn pause(&mut self) -> RecorderResult<()> {
        self.check(Command::Pause, &[SessionState::Recording])?;
        self.attached()?.ingress.set_phase(Phase::Paused);
        if let Err(e) = self.timer(TimerAction::Pause).await {
            self.attached()?.ingress.set_phase(Phase::Recording);
            return Err(e);
        }
        self.state = SessionState::Paused;
        info!(session_id = ?self.session_id(), "Recording paused");
        Ok(())
    }

    pub async fn resume(&mut self) -> RecorderResult<()> {
        self.check(Command::Resume, &[SessionState::Paused])?;
        self.timer(TimerAction::Resume).await?;
        self.attached()?.ingress.set_phase(Phase::Recording);
        self.state = SessionState::Recording;
        info!(session_id = ?self.session_id(), "Recording resumed");
        Ok(())
    }

    /// Finish the recording and hand its artifact to the upload manager
    ///
    /// Order: metrics finalize, final log flush, encoder finalize, upload
    /// hand-off. A failed final flush is reported after the hand-off.
    pub async fn stop(&mut self) -> RecorderResult<StopReport> {
        self.check(
            Command::Stop,
            &[SessionState::Recording, SessionState::Paused],
        )?;
        let attached = self.attached.take().ok_or(RecorderError::WorkerGone)?;
        attached.ingress.set_phase(Phase::Inactive);
        self.state = SessionState::Finished;

        let mut session = attached.session.clone();
        session.state = SessionState::Finished;
        session.readings_count = attached.readings_count.load(Ordering::Relaxed);
        self.finished = Some(session.clone());

        let end = self.context.clock.now_ms();
        let stop: LogEntry = TimerEvent::new(end, TimerAction::Stop).into();
        let (reply, response) = oneshot::channel();
        if !attached.ingress.send(Ingested::Entry(stop)).await
            || !attached.ingress.send(Ingested::Finish(reply)).await
        {
            return Err(RecorderError::WorkerGone);
        }
        let consumed = response.await.map_err(|_| RecorderError::WorkerGone)?;
        let _ = attached.consumer.await;

        let Consumed {
            mut engine,
            mut log,
            mut encoder,
            encode_error,
        } = consumed;

        let summary = engine.finalize(end)?;
        // Purge and quota stay off the log until its task exists
        let hold = log.hold();
        let flush = log.finish().await;
        if let Err(e) = &flush {
            error!(session_id = %session.id, error = %e, "Final flush failed");
        }

        let artifact = match encode_error {
            None => encoder.finalize(&summary)?,
            Some(cause) if flush.is_ok() => self.rebuild_from_log(&session.id, cause)?,
            Some(cause) => return Err(cause.into()),
        };
        if let Some(metrics) = &self.context.metrics {
            metrics.record_artifact_encoded(artifact.size);
        }

        let task = self.context.uploads.enqueue(UploadRequest::new(
            session.id.clone(),
            session.owner.clone(),
            artifact.bytes.clone(),
        ))?;
        drop(hold);

        match flush {
            Ok(flush) => {
                if let Some(finished) = self.finished.as_mut() {
                    finished.chunk_index = flush.chunk_index;
                }
                if !flush.durable {
                    warn!(
                        session_id = %session.id,
                        in_memory_chunks = flush.in_memory_chunks,
                        "Recording finished after running degraded"
                    );
                }
                info!(
                    session_id = %session.id,
                    task_id = %task.id,
                    chunk_index = flush.chunk_index,
                    size = artifact.size,
                    records = artifact.records,
                    "Recording finished"
                );
                Ok(StopReport {
                    session_id: session.id,
                    summary,
                    artifact_size: artifact.size,
                    records: artifact.records,
                    task,
                    flush,
                })
            }
            Err(source) => Err(RecorderError::FinalFlush {
                task_id: Some(task.id),
                source,
            }),
        }
    }
}

impl Recorder {
    /// Re-encode a just-finished log after the live encoder gave up on it
    fn rebuild_from_log(
        &self,
        session_id: &SessionId,
        cause: EncodeError,
    ) -> RecorderResult<FitArtifact> {
        let recovered = self.context.store.load(session_id)?;
        let rebuilt = rebuild_artifact(
            &recovered,
            &self.context.config.metrics,
            &self.context.config.encoder,
        )
        .map_err(|e| {
            error!(session_id = %session_id, error = %e, "Rebuild from the log failed");
            RecorderError::Encode(cause.clone())
        })?;
        warn!(
            session_id = %session_id,
            cause = %cause,
            size = rebuilt.artifact.size,
            "Artifact rebuilt from the session log"
        );
        Ok(rebuilt.artifact)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(attached) = self.attached.take() {
            warn!(
                session_id = %attached.session.id,
                state = %self.state,
                "Recorder dropped mid-session; the log stays resumable"
            );
            attached.consumer.abort();
        }
    }
}
