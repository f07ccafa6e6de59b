//! Upload manager
//!
//! Owns finalized artifacts until the remote store accepts them. Every task is
//! persisted before it is acknowledged, attempts back off exponentially, and
//! tasks that exhaust their budget (or fail permanently) wait in the dead-letter
//! queue for an explicit decision.

use crate::backoff::RetryPolicy;
use crate::error::{PutError, UploadError, UploadResult};
use crate::object_store::ObjectStore;
use crate::task::{
    AttemptOutcome, AttemptRecord, ResolveAction, TaskFilter, UploadRequest, UploadState,
    UploadTask,
};
use crate::task_store::TaskStore;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use pacer_core::SessionId;
use pacer_core::config::UploadConfig;
use pacer_observability::PipelineMetrics;
use pacer_storage::{RetentionIndex, write_atomic};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, error, info, warn};

/// Upper bound on any single wait, whatever the server asks for
const MAX_RETRY_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Called when a task settles (`resolved` or `dead_letter`)
pub type SettlementListener = Arc<dyn Fn(&UploadTask) + Send + Sync>;

pub struct UploadManager {
    config: UploadConfig,
    policy: RetryPolicy,
    object_store: Arc<dyn ObjectStore>,
    task_store: TaskStore,
    tasks: DashMap<String, UploadTask>,
    in_flight: DashSet<String>,
    wake: Notify,
    listeners: RwLock<Vec<SettlementListener>>,
    /// Artifacts of evicted resolved tasks that could not be removed
    leftover_artifacts: DashSet<PathBuf>,
    metrics: Option<PipelineMetrics>,
}

enum Attempted {
    Stored,
    Corrupt(String),
    Failed(PutError),
}

/// Marks a task as being attempted for the guard's lifetime
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    task_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a DashSet<String>, task_id: &str) -> UploadResult<Self> {
        if !set.insert(task_id.to_string()) {
            return Err(UploadError::InFlight(task_id.to_string()));
        }
        Ok(Self {
            set,
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.task_id);
    }
}

impl UploadManager {
    /// Open the artifact directory and reload persisted tasks
    pub fn open(config: UploadConfig, object_store: Arc<dyn ObjectStore>) -> UploadResult<Self> {
        config.validate().map_err(UploadError::Config)?;
        fs::create_dir_all(&config.artifact_dir)?;
        let task_store = TaskStore::open(&config.artifact_dir)?;

        let tasks = DashMap::new();
        for task in task_store.load_all()? {
            if task.state == UploadState::Resolved {
                // Crashed between settling and cleanup
                remove_artifact(&task.artifact_path);
                task_store.remove(&task.id)?;
                continue;
            }
            tasks.insert(task.id.clone(), task);
        }

        info!(
            artifact_dir = %config.artifact_dir.display(),
            tasks = tasks.len(),
            "Upload manager opened"
        );

        Ok(Self {
            policy: RetryPolicy::from_config(&config),
            config,
            object_store,
            task_store,
            tasks,
            in_flight: DashSet::new(),
            wake: Notify::new(),
            listeners: RwLock::new(Vec::new()),
            leftover_artifacts: DashSet::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self.update_gauges();
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.config.artifact_dir
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a callback for tasks reaching `resolved` or `dead_letter`
    pub fn on_settlement(&self, listener: SettlementListener) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Take ownership of a finalized artifact
    pub fn enqueue(&self, request: UploadRequest) -> UploadResult<UploadTask> {
        let duplicate = self.tasks.iter().any(|t| {
            t.session_id == request.session_id && t.state != UploadState::Resolved
        });
        if duplicate {
            return Err(UploadError::Duplicate(request.session_id.to_string()));
        }

        let artifact_path = self
            .config
            .artifact_dir
            .join(format!("{}.fit", request.session_id));
        write_atomic(&artifact_path, &request.artifact)?;

        let task = UploadTask::new(
            request.session_id,
            request.owner,
            artifact_path,
            request.artifact.len() as u64,
            Utc::now(),
        );
        self.task_store.save(&task)?;
        self.tasks.insert(task.id.clone(), task.clone());
        self.update_gauges();

        info!(
            task_id = %task.id,
            session_id = %task.session_id,
            size = task.size,
            remote_path = %task.remote_path,
            "Upload task enqueued"
        );
        self.wake.notify_one();
        Ok(task)
    }

    /// Make one attempt at uploading a pending or retrying task
    ///
    /// Returns the state the task settled into after the attempt.
    pub async fn attempt(&self, task_id: &str) -> UploadResult<UploadState> {
        let _guard = InFlightGuard::acquire(&self.in_flight, task_id)?;
        let mut task = self
            .get(task_id)
            .ok_or_else(|| UploadError::NotFound(task_id.to_string()))?;
        if !task.state.is_active() {
            return Err(UploadError::InvalidState {
                task_id: task_id.to_string(),
                state: task.state,
                action: "attempt",
            });
        }

        let attempt = task.attempt_count + 1;
        let started = Instant::now();
        debug!(task_id, attempt, "Attempting upload");

        let result = match load_artifact(&task.artifact_path).await {
            Ok(body) => match self.object_store.put(&task.remote_path, body).await {
                Ok(()) => Attempted::Stored,
                Err(e) => Attempted::Failed(e),
            },
            Err(reason) => Attempted::Corrupt(reason),
        };
        let elapsed = started.elapsed();
        let now = Utc::now();
        task.attempt_count = attempt;
        task.updated_at = now;

        let outcome = match result {
            Attempted::Stored => {
                task.state = UploadState::Resolved;
                task.next_retry_at = None;
                task.last_error = None;
                info!(
                    task_id,
                    session_id = %task.session_id,
                    attempt,
                    duration_ms = elapsed.as_millis() as u64,
                    "Upload succeeded"
                );
                AttemptOutcome::Success
            }
            Attempted::Corrupt(reason) => {
                error!(
                    task_id,
                    session_id = %task.session_id,
                    error = %reason,
                    "Artifact failed verification, moving to dead letter"
                );
                task.last_error = Some(reason);
                self.move_to_dead_letter(&mut task);
                AttemptOutcome::Corrupt
            }
            Attempted::Failed(PutError::Retryable {
                message,
                retry_after,
            }) => {
                task.last_error = Some(message.clone());
                if self.policy.is_exhausted(attempt) {
                    error!(
                        task_id,
                        session_id = %task.session_id,
                        attempt,
                        error = %message,
                        "Upload attempts exhausted, moving to dead letter"
                    );
                    self.move_to_dead_letter(&mut task);
                } else {
                    let backoff = self.policy.delay_with_jitter(attempt, &mut rand::rng());
                    let wait = backoff
                        .max(retry_after.unwrap_or_default())
                        .min(MAX_RETRY_WAIT);
                    task.state = UploadState::Retrying;
                    task.next_retry_at = Some(now + to_chrono(wait));
                    warn!(
                        task_id,
                        attempt,
                        retry_in_ms = wait.as_millis() as u64,
                        error = %message,
                        "Upload failed, will retry"
                    );
                }
                AttemptOutcome::Retryable
            }
            Attempted::Failed(PutError::Permanent { message }) => {
                error!(
                    task_id,
                    session_id = %task.session_id,
                    error = %message,
                    "Upload rejected permanently, moving to dead letter"
                );
                task.last_error = Some(message);
                self.move_to_dead_letter(&mut task);
                AttemptOutcome::Permanent
            }
        };

        task.history.push(AttemptRecord {
            attempt,
            at: now,
            outcome,
            duration_ms: elapsed.as_millis() as u64,
            error: task.last_error.clone(),
        });
        if let Some(metrics) = &self.metrics {
            metrics.record_upload_attempt(outcome.as_str(), elapsed.as_secs_f64());
        }

        let state = task.state;
        self.commit(task)?;
        Ok(state)
    }

    /// Attempt every due task once; returns how many attempts were made
    pub async fn run_due(&self) -> usize {
        let mut attempted = 0;
        for task_id in self.due_task_ids(Utc::now()) {
            match self.attempt(&task_id).await {
                Ok(_) => attempted += 1,
                Err(UploadError::InFlight(_)) | Err(UploadError::InvalidState { .. }) => {}
                Err(e) => {
                    attempted += 1;
                    error!(task_id = %task_id, error = %e, "Upload attempt could not be recorded");
                }
            }
        }
        attempted
    }

    /// Ids of tasks due at `now`, oldest first
    pub fn due_task_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .tasks
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| (t.created_at, t.id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest moment an active task becomes due
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter(|t| t.state.is_active())
            .map(|t| t.next_retry_at.unwrap_or(t.updated_at))
            .min()
    }

    /// Drop the backoff of every waiting task, e.g. once connectivity returns
    pub fn make_all_due(&self) -> usize {
        let mut woken = 0;
        for mut task in self.tasks.iter_mut() {
            if task.state.is_active() && task.next_retry_at.take().is_some() {
                woken += 1;
            }
        }
        if woken > 0 {
            debug!(woken, "Backoff cleared for waiting uploads");
            self.wake.notify_one();
        }
        woken
    }

    pub fn get(&self, task_id: &str) -> Option<UploadTask> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Tasks matching `filter`, oldest first
    pub fn list(&self, filter: &TaskFilter) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Decide the fate of a dead-letter task
    pub fn resolve(&self, task_id: &str, action: ResolveAction) -> UploadResult<UploadTask> {
        let mut task = self
            .get(task_id)
            .ok_or_else(|| UploadError::NotFound(task_id.to_string()))?;
        if task.state != UploadState::DeadLetter {
            return Err(UploadError::InvalidState {
                task_id: task_id.to_string(),
                state: task.state,
                action: "resolve",
            });
        }

        task.updated_at = Utc::now();
        match action {
            ResolveAction::Retry => {
                task.state = UploadState::Pending;
                task.attempt_count = 0;
                task.next_retry_at = None;
                info!(task_id, session_id = %task.session_id, "Dead-letter task re-queued");
            }
            ResolveAction::Discard => {
                task.state = UploadState::Resolved;
                info!(task_id, session_id = %task.session_id, "Dead-letter task discarded");
            }
        }

        self.commit(task.clone())?;
        if action == ResolveAction::Retry {
            self.wake.notify_one();
        }
        Ok(task)
    }

    /// Swap in a rebuilt artifact for a task dead-lettered as corrupt and queue it again
    pub fn replace_artifact(&self, task_id: &str, artifact: Bytes) -> UploadResult<UploadTask> {
        let mut task = self
            .get(task_id)
            .ok_or_else(|| UploadError::NotFound(task_id.to_string()))?;
        if task.state != UploadState::DeadLetter {
            return Err(UploadError::InvalidState {
                task_id: task_id.to_string(),
                state: task.state,
                action: "replace artifact",
            });
        }

        write_atomic(&task.artifact_path, &artifact)?;
        task.size = artifact.len() as u64;
        task.state = UploadState::Pending;
        task.attempt_count = 0;
        task.next_retry_at = None;
        task.updated_at = Utc::now();
        info!(
            task_id,
            session_id = %task.session_id,
            size = task.size,
            "Artifact replaced, upload re-queued"
        );

        self.commit(task.clone())?;
        self.wake.notify_one();
        Ok(task)
    }

    /// Wake the scheduler
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    fn move_to_dead_letter(&self, task: &mut UploadTask) {
        task.state = UploadState::DeadLetter;
        task.next_retry_at = None;
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter();
        }
    }

    /// Persist a state change, publish it and notify listeners on settlement
    ///
    /// Resolved tasks leave the map once their listeners have run.
    fn commit(&self, task: UploadTask) -> UploadResult<()> {
        let persisted = if task.state == UploadState::Resolved {
            remove_artifact(&task.artifact_path);
            self.task_store.remove(&task.id)
        } else {
            self.task_store.save(&task)
        };
        if let Err(e) = &persisted {
            error!(task_id = %task.id, error = %e, "Failed to persist upload task");
        }

        let settled = matches!(task.state, UploadState::Resolved | UploadState::DeadLetter);
        self.tasks.insert(task.id.clone(), task.clone());
        self.update_gauges();

        if settled {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            for listener in listeners {
                listener(&task);
            }
        }
        if task.state == UploadState::Resolved {
            self.tasks.remove(&task.id);
            if task.artifact_path.exists() {
                self.leftover_artifacts.insert(task.artifact_path.clone());
            }
            self.update_gauges();
        }
        persisted
    }

    fn update_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        for state in UploadState::ALL {
            let count = self.tasks.iter().filter(|t| t.state == state).count();
            metrics.set_upload_tasks(state.as_str(), count);
        }
    }
}

impl RetentionIndex for UploadManager {
    fn resolved_artifacts(&self) -> Vec<PathBuf> {
        self.leftover_artifacts.retain(|path| path.exists());
        self.leftover_artifacts
            .iter()
            .map(|path| path.key().clone())
            .collect()
    }

    fn is_protected(&self, session_id: &SessionId) -> bool {
        self.tasks
            .iter()
            .any(|t| t.session_id == *session_id && t.state != UploadState::Resolved)
    }
}

/// Read an artifact and verify its framing and checksums
async fn load_artifact(path: &Path) -> Result<Bytes, String> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("artifact unreadable: {}", e))?;
    pacer_fit::validate(&data).map_err(|e| format!("artifact corrupt: {}", e))?;
    Ok(Bytes::from(data))
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Artifact removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
