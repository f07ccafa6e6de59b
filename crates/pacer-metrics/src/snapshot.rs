//! Snapshots published by the metrics engine

use pacer_core::{MetricKind, MonotonicMs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    /// Time covered by consecutive readings inside recording segments
    pub active_seconds: f64,
}

/// Which threshold the intensity factor was computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityBasis {
    Power,
    HeartRate,
}

/// Final session summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Active time, stops advancing while paused
    pub duration_seconds: f64,
    /// Wall clock from start to end, pauses included
    pub wall_seconds: f64,
    pub rolling_30s_power_avg: Option<f64>,
    pub metrics: BTreeMap<MetricKind, MetricSummary>,
    pub power_zone_seconds: Option<Vec<f64>>,
    pub heart_rate_zone_seconds: Option<Vec<f64>>,
    pub normalized_power: Option<f64>,
    pub intensity_factor: Option<f64>,
    pub intensity_basis: Option<IntensityBasis>,
    pub training_stress_score: Option<f64>,
    pub threshold_power: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub readings_count: u64,
    /// Monotonic timestamps bounding the session, when it was started
    pub started_at: Option<MonotonicMs>,
    pub ended_at: MonotonicMs,
}

impl MetricsSnapshot {
    pub fn summary(&self, metric: MetricKind) -> Option<&MetricSummary> {
        self.metrics.get(&metric)
    }

    pub fn average(&self, metric: MetricKind) -> Option<f64> {
        self.summary(metric).and_then(|s| s.avg)
    }

    pub fn maximum(&self, metric: MetricKind) -> Option<f64> {
        self.summary(metric).and_then(|s| s.max)
    }
}

/// Cheap view refreshed about once a second while recording
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub at: MonotonicMs,
    pub recording: bool,
    /// Active time so far, frozen while paused
    pub duration_seconds: f64,
    /// Wall clock since start
    pub wall_seconds: f64,
    /// Latest value per metric
    pub current: BTreeMap<MetricKind, f64>,
    pub rolling_30s_power_avg: Option<f64>,
    pub normalized_power: Option<f64>,
    pub power_zone: Option<usize>,
    pub heart_rate_zone: Option<usize>,
    pub total_distance_m: Option<f64>,
    pub readings_count: u64,
}
