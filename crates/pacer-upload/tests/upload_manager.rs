//! Upload manager behavior against a mocked object store

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use mockall::mock;
use pacer_core::config::{EncoderConfig, MetricsConfig, UploadConfig};
use pacer_core::{
    ClockOrigin, LogEntry, ProfileSnapshot, Reading, SessionId, TimerAction, TimerEvent,
};
use pacer_fit::FitEncoder;
use pacer_metrics::replay;
use pacer_observability::PipelineMetrics;
use pacer_storage::RetentionIndex;
use pacer_upload::{
    AttemptOutcome, ObjectStore, PutError, ResolveAction, TaskFilter, UploadError,
    UploadManager, UploadRequest, UploadState, UploadTask, spawn_scheduler,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

mock! {
    pub Store {}

    #[async_trait]
    impl ObjectStore for Store {
        async fn put(&self, path: &str, body: Bytes) -> Result<(), PutError>;
    }
}

fn config(dir: &TempDir, max_attempts: u32) -> UploadConfig {
    UploadConfig {
        artifact_dir: dir.path().join("uploads"),
        max_attempts,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter_ratio: 0.0,
        poll_interval_ms: 20,
        ..UploadConfig::default()
    }
}

/// A small but complete FIT artifact
fn artifact() -> Bytes {
    let origin = ClockOrigin::new(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(), 0);
    let mut entries: Vec<LogEntry> = vec![TimerEvent::new(0, TimerAction::Start).into()];
    for s in 0..30u64 {
        entries.push(Reading::power(s * 1000, 180.0).into());
    }
    entries.push(TimerEvent::new(30_000, TimerAction::Stop).into());

    let snapshot = replay(
        ProfileSnapshot::default(),
        &MetricsConfig::default(),
        &entries,
        30_000,
    )
    .unwrap();
    let mut encoder = FitEncoder::new(origin, &EncoderConfig::default());
    for entry in &entries {
        encoder.apply(entry).unwrap();
    }
    encoder.finalize(&snapshot).unwrap().bytes
}

fn request(owner: &str) -> UploadRequest {
    UploadRequest::new(SessionId::generate(), owner, artifact())
}

/// Store that fails with a retryable error `failures` times, then succeeds
fn flaky_store(failures: u32, total_calls: usize) -> (MockStore, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut store = MockStore::new();
    store
        .expect_put()
        .times(total_calls)
        .returning(move |_, _| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call < failures {
                Err(PutError::retryable("HTTP 503"))
            } else {
                Ok(())
            }
        });
    (store, calls)
}

#[tokio::test]
async fn test_retryable_failures_then_success_resolves_task() {
    let dir = TempDir::new().unwrap();
    let (store, calls) = flaky_store(2, 3);
    let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();

    let settled = Arc::new(Mutex::new(Vec::<UploadTask>::new()));
    let sink = settled.clone();
    manager.on_settlement(Arc::new(move |task: &UploadTask| {
        sink.lock().unwrap().push(task.clone());
    }));

    let request = request("athlete");
    let session_id = request.session_id.clone();
    let task = manager.enqueue(request).unwrap();
    assert!(task.artifact_path.exists());
    assert_eq!(task.remote_path, format!("athlete/{}.bin", session_id));

    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::Retrying);
    let waiting = manager.get(&task.id).unwrap();
    assert_eq!(waiting.attempt_count, 1);
    assert!(waiting.next_retry_at.is_some());
    assert_eq!(waiting.last_error.as_deref(), Some("HTTP 503"));

    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::Retrying);
    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::Resolved);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Settled tasks are handed to listeners, then evicted
    assert!(manager.get(&task.id).is_none());
    assert!(manager.list(&TaskFilter::all()).is_empty());
    let settled = settled.lock().unwrap().clone();
    assert_eq!(settled.len(), 1);
    let resolved = &settled[0];
    assert_eq!(resolved.session_id, session_id);
    assert_eq!(resolved.state, UploadState::Resolved);
    assert_eq!(resolved.attempt_count, 3);
    let outcomes: Vec<_> = resolved.history.iter().map(|h| h.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Retryable,
            AttemptOutcome::Retryable,
            AttemptOutcome::Success
        ]
    );
    assert!(!task.artifact_path.exists());
    assert!(
        std::fs::read_dir(dir.path().join("uploads/tasks"))
            .unwrap()
            .next()
            .is_none()
    );

    assert!(!manager.is_protected(&session_id));
    assert!(manager.resolved_artifacts().is_empty());
}

#[tokio::test]
async fn test_exhausted_task_moves_to_dead_letter_and_stays_there() {
    let dir = TempDir::new().unwrap();
    let mut store = MockStore::new();
    store
        .expect_put()
        .times(3)
        .returning(|_, _| Err(PutError::retryable("HTTP 502")));
    let metrics = PipelineMetrics::new().unwrap();
    let manager = UploadManager::open(config(&dir, 3), Arc::new(store))
        .unwrap()
        .with_metrics(metrics.clone());

    let task = manager.enqueue(request("athlete")).unwrap();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.run_due().await;
    }

    let dead = manager.get(&task.id).unwrap();
    assert_eq!(dead.state, UploadState::DeadLetter);
    assert_eq!(dead.attempt_count, 3);
    assert!(dead.artifact_path.exists());
    assert!(manager.is_protected(&dead.session_id));

    // Never attempted automatically again
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.run_due().await, 0);
    assert!(manager.due_task_ids(Utc::now() + chrono::Duration::days(1)).is_empty());
    assert!(matches!(
        manager.attempt(&task.id).await,
        Err(UploadError::InvalidState { .. })
    ));

    let listed = manager.list(&TaskFilter::state(UploadState::DeadLetter));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, task.id);

    let text = metrics.gather_text().unwrap();
    assert!(text.contains("pacer_dead_letter_total 1"));
}

#[tokio::test]
async fn test_permanent_error_dead_letters_immediately() {
    let dir = TempDir::new().unwrap();
    let mut store = MockStore::new();
    store
        .expect_put()
        .times(1)
        .returning(|_, _| Err(PutError::permanent("HTTP 403")));
    let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();

    let settled = Arc::new(AtomicU32::new(0));
    let counter = settled.clone();
    manager.on_settlement(Arc::new(move |task: &UploadTask| {
        assert_eq!(task.state, UploadState::DeadLetter);
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let task = manager.enqueue(request("athlete")).unwrap();
    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::DeadLetter);

    let dead = manager.get(&task.id).unwrap();
    assert_eq!(dead.attempt_count, 1);
    assert_eq!(dead.last_error.as_deref(), Some("HTTP 403"));
    assert_eq!(settled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_artifact_dead_letters_without_uploading() {
    let dir = TempDir::new().unwrap();
    // No expectations: any put would panic
    let manager = UploadManager::open(config(&dir, 5), Arc::new(MockStore::new())).unwrap();

    let task = manager
        .enqueue(UploadRequest::new(
            SessionId::generate(),
            "athlete",
            Bytes::from_static(b"not a fit file at all"),
        ))
        .unwrap();
    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::DeadLetter);

    let dead = manager.get(&task.id).unwrap();
    assert_eq!(dead.history.len(), 1);
    assert_eq!(dead.history[0].outcome, AttemptOutcome::Corrupt);
    assert!(dead.last_error.unwrap().contains("corrupt"));
}

#[tokio::test]
async fn test_replaced_artifact_is_uploaded() {
    let dir = TempDir::new().unwrap();
    let uploaded = Arc::new(Mutex::new(Vec::<Bytes>::new()));
    let sink = uploaded.clone();
    let mut store = MockStore::new();
    store.expect_put().times(1).returning(move |_, body| {
        sink.lock().unwrap().push(body);
        Ok(())
    });
    let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();

    let mut request = request("athlete");
    let good = request.artifact.clone();
    request.artifact = Bytes::from_static(b"truncated artifact");
    let task = manager.enqueue(request).unwrap();

    assert!(matches!(
        manager.replace_artifact(&task.id, good.clone()),
        Err(UploadError::InvalidState { .. })
    ));
    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::DeadLetter);
    assert!(manager.get(&task.id).unwrap().is_corrupt_dead_letter());

    let requeued = manager.replace_artifact(&task.id, good.clone()).unwrap();
    assert_eq!(requeued.state, UploadState::Pending);
    assert_eq!(requeued.size, good.len() as u64);
    assert_eq!(requeued.corrupt_attempts(), 1);
    assert!(manager.is_protected(&task.session_id));

    assert_eq!(manager.attempt(&task.id).await.unwrap(), UploadState::Resolved);
    assert_eq!(*uploaded.lock().unwrap(), vec![good]);
}

#[tokio::test]
async fn test_resolve_retry_and_discard() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut store = MockStore::new();
    store.expect_put().times(3).returning(move |_, _| {
        // First call for each task fails permanently, the retry succeeds
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err(PutError::permanent("HTTP 400")),
            _ => Ok(()),
        }
    });
    let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();

    let retried = manager.enqueue(request("athlete")).unwrap();
    let discarded = manager.enqueue(request("athlete")).unwrap();
    manager.attempt(&retried.id).await.unwrap();
    manager.attempt(&discarded.id).await.unwrap();

    // Only dead-letter tasks may be resolved
    let pending = manager.enqueue(request("athlete")).unwrap();
    assert!(matches!(
        manager.resolve(&pending.id, ResolveAction::Retry),
        Err(UploadError::InvalidState { .. })
    ));
    assert!(matches!(
        manager.resolve("missing", ResolveAction::Discard),
        Err(UploadError::NotFound(_))
    ));

    let requeued = manager.resolve(&retried.id, ResolveAction::Retry).unwrap();
    assert_eq!(requeued.state, UploadState::Pending);
    assert_eq!(requeued.attempt_count, 0);
    assert_eq!(requeued.history.len(), 1);
    assert_eq!(manager.attempt(&retried.id).await.unwrap(), UploadState::Resolved);

    let gone = manager.resolve(&discarded.id, ResolveAction::Discard).unwrap();
    assert_eq!(gone.state, UploadState::Resolved);
    assert!(manager.get(&discarded.id).is_none());
    assert!(!discarded.artifact_path.exists());
    assert!(!manager.is_protected(&discarded.session_id));
    assert!(manager.is_protected(&pending.session_id));
}

#[tokio::test]
async fn test_duplicate_session_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = UploadManager::open(config(&dir, 5), Arc::new(MockStore::new())).unwrap();

    let request = request("athlete");
    manager.enqueue(request.clone()).unwrap();
    assert!(matches!(
        manager.enqueue(request),
        Err(UploadError::Duplicate(_))
    ));
}

#[tokio::test]
async fn test_tasks_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (pending_id, dead_id) = {
        let mut store = MockStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _| Err(PutError::permanent("HTTP 404")));
        let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();
        let dead = manager.enqueue(request("athlete")).unwrap();
        manager.attempt(&dead.id).await.unwrap();
        let pending = manager.enqueue(request("coach")).unwrap();
        (pending.id, dead.id)
    };

    let (store, _) = flaky_store(0, 1);
    let manager = UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap();
    assert_eq!(manager.list(&TaskFilter::all()).len(), 2);
    assert_eq!(manager.get(&dead_id).unwrap().state, UploadState::DeadLetter);
    assert_eq!(
        manager.list(&TaskFilter::all().with_owner("coach"))[0].id,
        pending_id
    );

    assert_eq!(manager.due_task_ids(Utc::now()), vec![pending_id.clone()]);
    assert_eq!(manager.run_due().await, 1);
    assert!(manager.get(&pending_id).is_none());
    assert_eq!(manager.list(&TaskFilter::all()).len(), 1);
}

#[tokio::test]
async fn test_scheduler_waits_for_connectivity() {
    let dir = TempDir::new().unwrap();
    let (store, calls) = flaky_store(1, 2);
    let manager = Arc::new(UploadManager::open(config(&dir, 5), Arc::new(store)).unwrap());
    let (online_tx, online_rx) = watch::channel(false);
    let scheduler = spawn_scheduler(manager.clone(), online_rx);

    let task = manager.enqueue(request("athlete")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get(&task.id).unwrap().state, UploadState::Pending);

    online_tx.send(true).unwrap();
    let resolved = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.get(&task.id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(resolved.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    scheduler.shutdown().await;
}
