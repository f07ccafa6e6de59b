//! Single consumer of the ingestion queue
//!
//! Delivers every entry, in queue order, to the metrics engine, the session
//! log and the encoder. Runs the periodic log flush and the live metrics
//! refresh on independent timers.

use crate::ingress::Ingested;
use pacer_core::{Clock, LogEntry};
use pacer_fit::FitEncoder;
use pacer_metrics::{LiveMetrics, MetricsEngine};
use pacer_storage::SessionLog;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error};

/// Consumer state handed back when the recording stops
pub(crate) struct Consumed {
    pub engine: MetricsEngine,
    pub log: SessionLog,
    pub encoder: FitEncoder,
    /// First encoder failure, if any; the artifact cannot be trusted after it
    pub encode_error: Option<pacer_fit::EncodeError>,
}

pub(crate) struct ConsumerSettings {
    pub flush_interval: Duration,
    pub live_interval: Duration,
}

pub(crate) fn spawn_consumer(
    mut rx: mpsc::Receiver<Ingested>,
    mut state: Consumed,
    settings: ConsumerSettings,
    clock: Arc<dyn Clock>,
    live_tx: watch::Sender<LiveMetrics>,
    readings_count: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session_id = state.log.session_id().clone();
        let start = Instant::now();
        let mut flush_timer = interval_at(start + settings.flush_interval, settings.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut live_timer = interval_at(start + settings.live_interval, settings.live_interval);
        live_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(Ingested::Entry(entry)) => deliver(&mut state, entry, &readings_count),
                    Some(Ingested::Finish(reply)) => {
                        live_tx.send_replace(state.engine.live_snapshot(clock.now_ms()));
                        if reply.send(state).is_err() {
                            error!(session_id = %session_id, "Recorder dropped before collecting the session");
                        }
                        break;
                    }
                    None => {
                        debug!(session_id = %session_id, "Ingestion queue closed");
                        break;
                    }
                },
                _ = flush_timer.tick() => {
                    state.log.flush();
                }
                _ = live_timer.tick() => {
                    live_tx.send_replace(state.engine.live_snapshot(clock.now_ms()));
                }
            }
        }

        debug!(session_id = %session_id, "Session consumer exited");
    })
}

fn deliver(state: &mut Consumed, entry: LogEntry, readings_count: &AtomicU64) {
    state.engine.apply(&entry);
    if state.encode_error.is_none()
        && let Err(e) = state.encoder.apply(&entry)
    {
        error!(
            session_id = %state.log.session_id(),
            error = %e,
            "Encoder rejected an entry; artifact will be rebuilt from the log"
        );
        state.encode_error = Some(e);
    }
    if matches!(entry, LogEntry::Reading(_)) {
        readings_count.fetch_add(1, Ordering::Relaxed);
    }
    state.log.append(entry);
}
