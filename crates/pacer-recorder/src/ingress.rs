//! Sensor ingress
//!
//! Sensors push readings from any thread through a cloneable [`Ingress`]
//! handle. Each reading is validated, gated on the recording phase, filtered
//! per metric and offered to the single ingestion queue. Nothing here blocks
//! or returns an error: rejected readings are counted by reason.

use pacer_core::config::IngressConfig;
use pacer_core::geo::haversine_m;
use pacer_core::{GeoPoint, LogEntry, MetricKind, MetricValue, MonotonicMs, Reading};
use pacer_observability::PipelineMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Why a reading was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Malformed,
    /// Inside the minimum interval or distance of the last accepted reading
    Filtered,
    OutOfOrder,
    Paused,
    /// No recording in progress
    Inactive,
    /// Ingestion queue full
    Overflow,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Filtered => "filtered",
            DropReason::OutOfOrder => "out_of_order",
            DropReason::Paused => "paused",
            DropReason::Inactive => "inactive",
            DropReason::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub accepted: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub out_of_order: u64,
    pub paused: u64,
    pub inactive: u64,
    pub overflow: u64,
}

impl IngressStats {
    pub fn dropped(&self) -> u64 {
        self.malformed + self.filtered + self.out_of_order + self.paused + self.inactive + self.overflow
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    out_of_order: AtomicU64,
    paused: AtomicU64,
    inactive: AtomicU64,
    overflow: AtomicU64,
}

impl Counters {
    fn counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::Malformed => &self.malformed,
            DropReason::Filtered => &self.filtered,
            DropReason::OutOfOrder => &self.out_of_order,
            DropReason::Paused => &self.paused,
            DropReason::Inactive => &self.inactive,
            DropReason::Overflow => &self.overflow,
        }
    }

    fn snapshot(&self) -> IngressStats {
        IngressStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Relaxed),
            inactive: self.inactive.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

/// Where the recording is, as far as ingress is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Inactive,
    Recording,
    Paused,
}

/// Messages drained by the session consumer
pub(crate) enum Ingested {
    Entry(LogEntry),
    /// Hand the consumer's state back; sent once, after the stop event
    Finish(oneshot::Sender<crate::consumer::Consumed>),
}

struct Gate {
    phase: Phase,
    last_accepted: HashMap<MetricKind, MonotonicMs>,
    last_fix: Option<(MonotonicMs, GeoPoint)>,
}

struct Shared {
    config: IngressConfig,
    gate: Mutex<Gate>,
    tx: mpsc::Sender<Ingested>,
    counters: Counters,
    metrics: Option<PipelineMetrics>,
}

/// Cloneable push handle for sensor callbacks
#[derive(Clone)]
pub struct Ingress {
    shared: Arc<Shared>,
}

impl Ingress {
    pub(crate) fn new(
        config: IngressConfig,
        metrics: Option<PipelineMetrics>,
    ) -> (Self, mpsc::Receiver<Ingested>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Shared {
            config,
            gate: Mutex::new(Gate {
                phase: Phase::Inactive,
                last_accepted: HashMap::new(),
                last_fix: None,
            }),
            tx,
            counters: Counters::default(),
            metrics,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Offer a reading to the recording. Never blocks, never fails.
    pub fn ingest(&self, reading: Reading) {
        match self.admit(reading) {
            Ok(metric) => {
                self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_reading_accepted(metric.as_str());
                }
            }
            Err(reason) => self.count_drop(reason),
        }
    }

    pub fn stats(&self) -> IngressStats {
        self.shared.counters.snapshot()
    }

    /// Filter and enqueue under the gate lock so acceptance order is queue order
    fn admit(&self, reading: Reading) -> Result<MetricKind, DropReason> {
        if let Err(e) = reading.validate() {
            debug!(error = %e, "Dropping malformed reading");
            return Err(DropReason::Malformed);
        }
        let metric = reading.metric();
        let timestamp = reading.timestamp;

        let mut gate = self.gate();
        match gate.phase {
            Phase::Inactive => return Err(DropReason::Inactive),
            Phase::Paused => return Err(DropReason::Paused),
            Phase::Recording => {}
        }

        if let Some(&last) = gate.last_accepted.get(&metric) {
            if timestamp < last {
                return Err(DropReason::OutOfOrder);
            }
            // Same-timestamp duplicates pass; last write wins downstream
            if timestamp > last {
                let keep = match &reading.value {
                    MetricValue::Location(point) => self.keep_fix(&gate, timestamp, point),
                    _ => timestamp - last >= self.shared.config.min_interval_ms,
                };
                if !keep {
                    return Err(DropReason::Filtered);
                }
            }
        }

        let fix = match &reading.value {
            MetricValue::Location(point) => Some(*point),
            _ => None,
        };
        match self.shared.tx.try_send(Ingested::Entry(reading.into())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(DropReason::Overflow),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(DropReason::Inactive),
        }

        gate.last_accepted.insert(metric, timestamp);
        if let Some(point) = fix {
            gate.last_fix = Some((timestamp, point));
        }
        Ok(metric)
    }

    fn keep_fix(&self, gate: &Gate, timestamp: MonotonicMs, point: &GeoPoint) -> bool {
        let Some((last_ts, last_point)) = &gate.last_fix else {
            return true;
        };
        let config = &self.shared.config;
        let elapsed = timestamp.saturating_sub(*last_ts);
        if elapsed >= config.location_keepalive_ms {
            return true;
        }
        if elapsed < config.location_min_interval_ms {
            return false;
        }
        haversine_m(last_point, point) >= config.location_min_distance_m
    }

    fn count_drop(&self, reason: DropReason) {
        let previous = self
            .shared
            .counters
            .counter(reason)
            .fetch_add(1, Ordering::Relaxed);
        if reason == DropReason::Overflow && previous == 0 {
            warn!("Ingestion queue full, dropping readings");
        }
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_reading_dropped(reason.as_str());
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.shared
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.gate().phase = phase;
    }

    /// Queue a control message behind every reading accepted so far
    pub(crate) async fn send(&self, message: Ingested) -> bool {
        self.shared.tx.send(message).await.is_ok()
    }
}
