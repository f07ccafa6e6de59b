//! Per-session durable log
//!
//! The [`SessionLog`] handle owns the active chunk and is driven by a single
//! task. Flushing swaps the active buffer for a fresh one and hands the full
//! chunk to a background worker, so appends never wait on disk.
//!
//! The worker writes the chunk, then its checkpoint, and only then advances
//! the durable index. Failed writes are retried with exponential backoff; a
//! chunk that exhausts its attempts degrades the log to in-memory mode and
//! every later chunk is kept in memory until the final flush.

use crate::error::{StorageError, StorageResult};
use crate::sink::ChunkSink;
use chrono::Utc;
use pacer_core::config::LogConfig;
use pacer_core::{Checkpoint, Chunk, LogEntry, SessionId};
use pacer_observability::PipelineMetrics;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Whether flushed chunks currently reach disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMode {
    Durable,
    Degraded { reason: String },
}

/// Published on every durable flush and mode change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStatus {
    pub session_id: SessionId,
    /// Sequence of the last durable chunk
    pub durable_index: u64,
    pub mode: LogMode,
    pub finished: bool,
}

impl LogStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, LogMode::Degraded { .. })
    }
}

/// Outcome of a successful final flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalFlushReport {
    /// Sequence of the last chunk, now durable
    pub chunk_index: u64,
    /// False when the log was degraded at some point
    pub durable: bool,
    /// Chunks that were held in memory until the final flush persisted them
    pub in_memory_chunks: usize,
}

/// Retry schedule for chunk and checkpoint writes
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl FlushPolicy {
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            max_attempts: config.flush_max_attempts.max(1),
            backoff_base: Duration::from_millis(config.flush_backoff_base_ms),
            backoff_max: Duration::from_millis(config.flush_backoff_max_ms),
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Keeps a session in the store's active set until dropped
pub struct ActiveGuard {
    active: Arc<Mutex<HashSet<SessionId>>>,
    session_id: SessionId,
}

impl ActiveGuard {
    pub(crate) fn register(
        active: Arc<Mutex<HashSet<SessionId>>>,
        session_id: SessionId,
    ) -> Option<Self> {
        let inserted = active
            .lock()
            .map(|mut set| set.insert(session_id.clone()))
            .unwrap_or(false);
        inserted.then_some(Self { active, session_id })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.active.lock() {
            set.remove(&self.session_id);
        }
    }
}

enum FlushCommand {
    Chunk(Chunk),
    Finish {
        last: Option<Chunk>,
        reply: oneshot::Sender<StorageResult<FinalFlushReport>>,
    },
}

/// Where a resumed log continues from
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub durable_index: u64,
    pub last_digest: Option<String>,
}

/// Handle to one session's durable log
pub struct SessionLog {
    session_id: SessionId,
    active: Vec<LogEntry>,
    next_sequence: u64,
    max_chunk_entries: usize,
    tx: mpsc::UnboundedSender<FlushCommand>,
    cancel: watch::Sender<bool>,
    status: watch::Receiver<LogStatus>,
    worker: Option<JoinHandle<()>>,
    guard: Option<ActiveGuard>,
}

impl SessionLog {
    /// Start a log writing to `sink`. Must be called inside a tokio runtime.
    pub fn with_sink(session_id: SessionId, sink: Arc<dyn ChunkSink>, config: &LogConfig) -> Self {
        Self::spawn(session_id, sink, config, ResumePoint::default(), None, None)
    }

    pub(crate) fn spawn(
        session_id: SessionId,
        sink: Arc<dyn ChunkSink>,
        config: &LogConfig,
        resume: ResumePoint,
        metrics: Option<PipelineMetrics>,
        guard: Option<ActiveGuard>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(LogStatus {
            session_id: session_id.clone(),
            durable_index: resume.durable_index,
            mode: LogMode::Durable,
            finished: false,
        });

        let worker = FlushWorker {
            session_id: session_id.clone(),
            sink,
            policy: FlushPolicy::from_config(config),
            status: status_tx,
            cancel: cancel_rx,
            metrics,
            durable_index: resume.durable_index,
            last_digest: resume.last_digest,
            degraded: None,
            memory: Vec::new(),
            deferred: Vec::new(),
        };
        let handle = tokio::spawn(worker.run(rx));

        let max_chunk_entries = config.max_chunk_entries.max(1);
        Self {
            session_id,
            active: Vec::with_capacity(max_chunk_entries),
            next_sequence: resume.durable_index + 1,
            max_chunk_entries,
            tx,
            cancel: cancel_tx,
            status: status_rx,
            worker: Some(handle),
            guard,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Append an entry; flushes when the active chunk is full
    pub fn append(&mut self, entry: LogEntry) {
        self.active.push(entry);
        if self.active.len() >= self.max_chunk_entries {
            self.flush();
        }
    }

    /// Hand the active chunk to the flush worker
    pub fn flush(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let chunk = self.take_chunk();
        let sequence = chunk.sequence;
        if self.tx.send(FlushCommand::Chunk(chunk)).is_err() {
            error!(
                session_id = %self.session_id,
                sequence,
                "Flush worker is gone, chunk dropped"
            );
        }
    }

    fn take_chunk(&mut self) -> Chunk {
        let entries = std::mem::replace(
            &mut self.active,
            Vec::with_capacity(self.max_chunk_entries),
        );
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Chunk {
            session_id: self.session_id.clone(),
            sequence,
            entries,
            flushed_at: Utc::now(),
        }
    }

    /// Entries not yet handed to the worker
    pub fn pending_entries(&self) -> usize {
        self.active.len()
    }

    /// Sequence the next flushed chunk will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn durable_index(&self) -> u64 {
        self.status.borrow().durable_index
    }

    /// Status updates (durable index, degraded mode)
    pub fn status(&self) -> watch::Receiver<LogStatus> {
        self.status.clone()
    }

    /// Take over the active marker so the session stays protected from
    /// purge and quota after `finish()` returns
    pub fn hold(&mut self) -> Option<ActiveGuard> {
        self.guard.take()
    }

    /// Final flush: persist every outstanding chunk and a final checkpoint
    ///
    /// Non-final retry loops are cancelled and their chunks folded into this
    /// flush, which itself is never cancelled.
    pub async fn finish(mut self) -> StorageResult<FinalFlushReport> {
        let last = (!self.active.is_empty()).then(|| self.take_chunk());
        let _ = self.cancel.send(true);

        let (reply, response) = oneshot::channel();
        self.tx
            .send(FlushCommand::Finish { last, reply })
            .map_err(|_| StorageError::WorkerGone)?;
        let result = response.await.map_err(|_| StorageError::WorkerGone)?;

        if let Some(handle) = self.worker.take() {
            let _ = handle.await;
        }
        result
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if self.worker.is_some() {
            warn!(
                session_id = %self.session_id,
                "SessionLog dropped without finish(); the log stays resumable"
            );
        }
    }
}

enum PersistError {
    Cancelled,
    Failed(StorageError),
}

struct FlushWorker {
    session_id: SessionId,
    sink: Arc<dyn ChunkSink>,
    policy: FlushPolicy,
    status: watch::Sender<LogStatus>,
    cancel: watch::Receiver<bool>,
    metrics: Option<PipelineMetrics>,
    durable_index: u64,
    last_digest: Option<String>,
    /// Set once a chunk exhausted its attempts
    degraded: Option<String>,
    /// Chunks kept in memory while degraded
    memory: Vec<Chunk>,
    /// Chunks whose retries were cancelled by the final flush
    deferred: Vec<Chunk>,
}

impl FlushWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FlushCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                FlushCommand::Chunk(chunk) => self.handle_chunk(chunk).await,
                FlushCommand::Finish { last, reply } => {
                    let result = self.finish(last).await;
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        debug!(
            session_id = %self.session_id,
            durable_index = self.durable_index,
            "Flush worker exited without a final flush"
        );
    }

    async fn handle_chunk(&mut self, chunk: Chunk) {
        if self.degraded.is_some() {
            self.memory.push(chunk);
            return;
        }
        // Keep chunk order: nothing may overtake a deferred chunk
        if !self.deferred.is_empty() || *self.cancel.borrow() {
            self.deferred.push(chunk);
            return;
        }

        match self.persist(&chunk, true).await {
            Ok(()) => {}
            Err(PersistError::Cancelled) => self.deferred.push(chunk),
            Err(PersistError::Failed(e)) => {
                self.degrade(chunk.sequence, &e);
                self.memory.push(chunk);
            }
        }
    }

    async fn write_once(&self, chunk: &Chunk) -> StorageResult<String> {
        let digest = self.sink.write_chunk(chunk).await?;
        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            chunk_index: chunk.sequence,
            is_final: false,
            created_at: Utc::now(),
            chunk_digest: Some(digest.clone()),
        };
        self.sink.write_checkpoint(&checkpoint).await?;
        Ok(digest)
    }

    async fn persist(&mut self, chunk: &Chunk, cancellable: bool) -> Result<(), PersistError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.write_once(chunk).await {
                Ok(digest) => {
                    self.durable_index = chunk.sequence;
                    self.last_digest = Some(digest);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_chunk_flushed(started.elapsed().as_secs_f64());
                    }
                    self.publish(false);
                    debug!(
                        session_id = %self.session_id,
                        sequence = chunk.sequence,
                        entries = chunk.len(),
                        attempt,
                        "Chunk durable"
                    );
                    return Ok(());
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_flush_failure();
                    }
                    warn!(
                        session_id = %self.session_id,
                        sequence = chunk.sequence,
                        attempt,
                        error = %e,
                        "Chunk flush failed, giving up"
                    );
                    return Err(PersistError::Failed(e));
                }
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_flush_retry();
                    }
                    let delay = self.policy.delay(attempt);
                    warn!(
                        session_id = %self.session_id,
                        sequence = chunk.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chunk flush failed, retrying"
                    );
                    if cancellable {
                        let mut cancel = self.cancel.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.wait_for(|cancelled| *cancelled) => {
                                return Err(PersistError::Cancelled);
                            }
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn degrade(&mut self, sequence: u64, error: &StorageError) {
        let reason = format!("chunk {} could not be persisted: {}", sequence, error);
        error!(
            session_id = %self.session_id,
            sequence,
            error = %error,
            "Session log degraded to in-memory mode"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_log_degraded();
        }
        self.degraded = Some(reason);
        self.publish(false);
    }

    fn publish(&self, finished: bool) {
        let mode = match &self.degraded {
            Some(reason) => LogMode::Degraded {
                reason: reason.clone(),
            },
            None => LogMode::Durable,
        };
        self.status.send_replace(LogStatus {
            session_id: self.session_id.clone(),
            durable_index: self.durable_index,
            mode,
            finished,
        });
    }

    async fn finish(&mut self, last: Option<Chunk>) -> StorageResult<FinalFlushReport> {
        let was_degraded = self.degraded.is_some();
        let in_memory_chunks = self.memory.len();

        let mut outstanding: Vec<Chunk> = self.deferred.drain(..).collect();
        outstanding.append(&mut self.memory);
        outstanding.extend(last);
        outstanding.sort_by_key(|chunk| chunk.sequence);

        let total = outstanding.len();
        for (i, chunk) in outstanding.iter().enumerate() {
            if let Err(e) = self.persist(chunk, false).await {
                let reason = match e {
                    PersistError::Failed(e) => e.to_string(),
                    PersistError::Cancelled => "cancelled".to_string(),
                };
                return Err(StorageError::FinalFlush {
                    session_id: self.session_id.to_string(),
                    durable_index: self.durable_index,
                    pending_chunks: total - i,
                    reason,
                });
            }
        }

        self.write_final_checkpoint().await?;
        self.publish(true);
        info!(
            session_id = %self.session_id,
            chunk_index = self.durable_index,
            in_memory_chunks,
            "Session log finalized"
        );

        Ok(FinalFlushReport {
            chunk_index: self.durable_index,
            durable: !was_degraded,
            in_memory_chunks,
        })
    }

    async fn write_final_checkpoint(&self) -> StorageResult<()> {
        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            chunk_index: self.durable_index,
            is_final: true,
            created_at: Utc::now(),
            chunk_digest: self.last_digest.clone(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.write_checkpoint(&checkpoint).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.policy.max_attempts => {
                    return Err(StorageError::FinalFlush {
                        session_id: self.session_id.to_string(),
                        durable_index: self.durable_index,
                        pending_chunks: 0,
                        reason: format!("final checkpoint: {}", e),
                    });
                }
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        attempt,
                        error = %e,
                        "Final checkpoint failed, retrying"
                    );
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pacer_core::Reading;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory sink that can be told to fail
    #[derive(Default)]
    struct MemorySink {
        broken: AtomicBool,
        fail_next: AtomicUsize,
        chunks: Mutex<Vec<Chunk>>,
        checkpoints: Mutex<Vec<Checkpoint>>,
    }

    impl MemorySink {
        fn check(&self) -> StorageResult<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Io(std::io::Error::other("transient")));
            }
            Ok(())
        }

        fn sequences(&self) -> Vec<u64> {
            self.chunks.lock().unwrap().iter().map(|c| c.sequence).collect()
        }
    }

    #[async_trait]
    impl ChunkSink for MemorySink {
        async fn write_chunk(&self, chunk: &Chunk) -> StorageResult<String> {
            self.check()?;
            self.chunks.lock().unwrap().push(chunk.clone());
            Ok(format!("digest-{}", chunk.sequence))
        }

        async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
            self.check()?;
            self.checkpoints.lock().unwrap().push(checkpoint.clone());
            Ok(())
        }
    }

    fn config(max_chunk_entries: usize) -> LogConfig {
        LogConfig {
            max_chunk_entries,
            flush_max_attempts: 3,
            flush_backoff_base_ms: 1,
            flush_backoff_max_ms: 5,
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = FlushPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(300),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(300));
        assert_eq!(policy.delay(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_full_chunk_flushes_and_checkpoints() {
        let sink = Arc::new(MemorySink::default());
        let mut log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &config(3));

        for s in 0..7u64 {
            log.append(Reading::power(s * 1000, 200.0).into());
        }
        assert_eq!(log.pending_entries(), 1);

        let mut status = log.status();
        status.wait_for(|s| s.durable_index == 2).await.unwrap();

        let report = log.finish().await.unwrap();
        assert_eq!(report.chunk_index, 3);
        assert!(report.durable);
        assert_eq!(sink.sequences(), vec![1, 2, 3]);

        let checkpoints = sink.checkpoints.lock().unwrap();
        let last = checkpoints.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.chunk_index, 3);
        assert_eq!(last.chunk_digest.as_deref(), Some("digest-3"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(MemorySink::default());
        sink.fail_next.store(2, Ordering::SeqCst);
        let mut log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &config(2));

        log.append(Reading::power(0, 200.0).into());
        log.append(Reading::power(1000, 200.0).into());

        let mut status = log.status();
        status.wait_for(|s| s.durable_index == 1).await.unwrap();
        assert!(!status.borrow().is_degraded());

        log.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_failure_degrades_then_final_flush_recovers() {
        let sink = Arc::new(MemorySink::default());
        sink.broken.store(true, Ordering::SeqCst);
        let mut log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &config(1));

        log.append(Reading::heart_rate(0, 120.0).into());
        let mut status = log.status();
        status.wait_for(|s| s.is_degraded()).await.unwrap();

        log.append(Reading::heart_rate(1000, 121.0).into());
        log.append(Reading::heart_rate(2000, 122.0).into());

        sink.broken.store(false, Ordering::SeqCst);
        let report = log.finish().await.unwrap();

        assert!(!report.durable);
        assert_eq!(report.chunk_index, 3);
        assert_eq!(sink.sequences(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_final_flush_failure_is_reported() {
        let sink = Arc::new(MemorySink::default());
        sink.broken.store(true, Ordering::SeqCst);
        let mut log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &config(10));

        log.append(Reading::cadence(0, 85.0).into());
        let err = log.finish().await.unwrap_err();

        match err {
            StorageError::FinalFlush {
                durable_index,
                pending_chunks,
                ..
            } => {
                assert_eq!(durable_index, 0);
                assert_eq!(pending_chunks, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_final_flush_cancels_pending_retry() {
        let sink = Arc::new(MemorySink::default());
        sink.fail_next.store(1, Ordering::SeqCst);
        let slow = LogConfig {
            max_chunk_entries: 1,
            flush_max_attempts: 5,
            flush_backoff_base_ms: 60_000,
            flush_backoff_max_ms: 60_000,
            ..LogConfig::default()
        };
        let mut log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &slow);

        log.append(Reading::power(0, 250.0).into());
        log.append(Reading::power(1000, 260.0).into());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = tokio::time::timeout(Duration::from_secs(5), log.finish())
            .await
            .expect("final flush must not wait for the retry backoff")
            .unwrap();

        assert_eq!(report.chunk_index, 2);
        assert_eq!(sink.sequences(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_session_gets_final_checkpoint() {
        let sink = Arc::new(MemorySink::default());
        let log = SessionLog::with_sink(SessionId::generate(), sink.clone(), &config(10));

        let report = log.finish().await.unwrap();
        assert_eq!(report.chunk_index, 0);
        let checkpoints = sink.checkpoints.lock().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].is_final);
    }
}
