//! Metrics engine
//!
//! Consumes log entries in ingestion order. Readings only count while a
//! recording segment is open (between start/resume and pause/stop).

use crate::error::{MetricsError, MetricsResult};
use crate::rolling::PowerSeries;
use crate::snapshot::{IntensityBasis, LiveMetrics, MetricsSnapshot};
use crate::track::MetricTrack;
use crate::zones::ZoneTable;
use pacer_core::config::MetricsConfig;
use pacer_core::geo::haversine_m;
use pacer_core::{
    GeoPoint, LogEntry, MetricKind, MetricValue, MonotonicMs, ProfileSnapshot, Reading,
    TimerAction,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Distance from consecutive GPS fixes
#[derive(Debug, Clone, Default)]
struct Odometer {
    anchor: Option<GeoPoint>,
    pending: Option<(MonotonicMs, GeoPoint)>,
    meters: f64,
    fixes: u64,
}

impl Odometer {
    fn add(&mut self, timestamp: MonotonicMs, point: GeoPoint) {
        match self.pending {
            Some((ts, _)) if ts == timestamp => {
                self.pending = Some((timestamp, point));
                return;
            }
            Some((ts, _)) if timestamp < ts => return,
            _ => {}
        }
        self.commit();
        self.pending = Some((timestamp, point));
    }

    fn commit(&mut self) {
        if let Some((_, point)) = self.pending.take() {
            if let Some(anchor) = self.anchor {
                self.meters += haversine_m(&anchor, &point);
            }
            self.anchor = Some(point);
            self.fixes += 1;
        }
    }

    fn suspend(&mut self) {
        self.commit();
        self.anchor = None;
    }

    fn distance(&self) -> Option<f64> {
        let open = match (self.anchor, self.pending) {
            (Some(anchor), Some((_, point))) => haversine_m(&anchor, &point),
            _ => 0.0,
        };
        (self.fixes > 0 || self.pending.is_some()).then_some(self.meters + open)
    }
}

/// Per-session metrics projection
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    profile: ProfileSnapshot,
    tracks: [MetricTrack; MetricKind::ALL.len()],
    power: PowerSeries,
    odometer: Odometer,
    started_at: Option<MonotonicMs>,
    segment_start: Option<MonotonicMs>,
    active_ms: u64,
    readings_count: u64,
    finalized: bool,
}

impl MetricsEngine {
    pub fn new(profile: ProfileSnapshot, config: &MetricsConfig) -> Self {
        let power_zones = ZoneTable::power(&profile, &config.power_zone_fractions);
        let heart_rate_zones = ZoneTable::heart_rate(&profile, &config.heart_rate_zone_fractions);
        let tracks = std::array::from_fn(|i| match MetricKind::ALL[i] {
            MetricKind::Power => MetricTrack::new(power_zones.clone()),
            MetricKind::HeartRate => MetricTrack::new(heart_rate_zones.clone()),
            _ => MetricTrack::new(None),
        });

        Self {
            profile,
            tracks,
            power: PowerSeries::new(),
            odometer: Odometer::default(),
            started_at: None,
            segment_start: None,
            active_ms: 0,
            readings_count: 0,
            finalized: false,
        }
    }

    pub fn profile(&self) -> &ProfileSnapshot {
        &self.profile
    }

    pub fn is_recording(&self) -> bool {
        self.segment_start.is_some() && !self.finalized
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn start(&mut self, timestamp: MonotonicMs) {
        if self.finalized || self.segment_start.is_some() {
            return;
        }
        if self.started_at.is_none() {
            self.started_at = Some(timestamp);
        }
        self.segment_start = Some(timestamp);
    }

    /// Stop duration accounting and break every elapsed-time chain
    pub fn pause(&mut self, timestamp: MonotonicMs) {
        if let Some(segment_start) = self.segment_start.take() {
            self.active_ms += timestamp.saturating_sub(segment_start);
            self.suspend_all();
        }
    }

    pub fn resume(&mut self, timestamp: MonotonicMs) {
        if self.started_at.is_some() {
            self.start(timestamp);
        }
    }

    fn suspend_all(&mut self) {
        for track in self.tracks.iter_mut() {
            track.suspend();
        }
        self.power.suspend();
        self.odometer.suspend();
    }

    /// Feed one reading. Returns whether it was counted.
    pub fn update(&mut self, reading: &Reading) -> bool {
        if !self.is_recording() {
            return false;
        }

        let metric = reading.metric();
        self.readings_count += 1;
        self.tracks[metric.index()].record(reading.timestamp, reading.value.scalar());

        match reading.value {
            MetricValue::Power(watts) => self.power.add(reading.timestamp, watts),
            MetricValue::Location(point) => self.odometer.add(reading.timestamp, point),
            _ => {}
        }
        true
    }

    /// Feed a log entry. Stop closes the segment; finalize stays explicit.
    pub fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::Reading(reading) => {
                self.update(reading);
            }
            LogEntry::Timer(event) => match event.action {
                TimerAction::Start => self.start(event.timestamp),
                TimerAction::Pause | TimerAction::Stop => self.pause(event.timestamp),
                TimerAction::Resume => self.resume(event.timestamp),
            },
        }
    }

    fn track(&self, metric: MetricKind) -> &MetricTrack {
        &self.tracks[metric.index()]
    }

    fn active_ms_at(&self, now: MonotonicMs) -> u64 {
        self.active_ms
            + self
                .segment_start
                .map(|start| now.saturating_sub(start))
                .unwrap_or(0)
    }

    fn total_distance(&self) -> Option<f64> {
        let track = self.track(MetricKind::Distance);
        if track.has_readings() {
            let committed = track.summary().max;
            let current = track.current();
            return match (committed, current) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        self.odometer.distance()
    }

    /// O(metrics) view for live display
    pub fn live_snapshot(&self, now: MonotonicMs) -> LiveMetrics {
        let current = MetricKind::ALL
            .iter()
            .filter_map(|metric| self.track(*metric).current().map(|v| (*metric, v)))
            .collect();

        LiveMetrics {
            at: now,
            recording: self.is_recording(),
            duration_seconds: self.active_ms_at(now) as f64 / 1000.0,
            wall_seconds: self
                .started_at
                .map(|start| now.saturating_sub(start) as f64 / 1000.0)
                .unwrap_or(0.0),
            current,
            rolling_30s_power_avg: self.power.rolling_average(),
            normalized_power: self.power.normalized_power(),
            power_zone: self.track(MetricKind::Power).current_zone(),
            heart_rate_zone: self.track(MetricKind::HeartRate).current_zone(),
            total_distance_m: self.total_distance(),
            readings_count: self.readings_count,
        }
    }

    /// Close the session and compute the summary. Callable exactly once.
    pub fn finalize(&mut self, end: MonotonicMs) -> MetricsResult<MetricsSnapshot> {
        if self.finalized {
            return Err(MetricsError::AlreadyFinalized);
        }
        self.pause(end);
        self.suspend_all();
        self.finalized = true;

        let duration_seconds = self.active_ms as f64 / 1000.0;
        let metrics: BTreeMap<_, _> = MetricKind::ALL
            .iter()
            .filter(|metric| self.track(**metric).has_readings())
            .map(|metric| (*metric, self.track(*metric).summary()))
            .collect();

        let normalized_power = self.power.normalized_power();
        let has_power = metrics.contains_key(&MetricKind::Power);
        let intensity = if has_power {
            normalized_power
                .zip(self.profile.ftp())
                .map(|(np, ftp)| (np / ftp, IntensityBasis::Power))
        } else {
            metrics
                .get(&MetricKind::HeartRate)
                .and_then(|hr| hr.avg)
                .zip(self.profile.lthr())
                .map(|(avg_hr, lthr)| (avg_hr / lthr, IntensityBasis::HeartRate))
        };
        let intensity_factor = intensity.map(|(factor, _)| factor);
        let training_stress_score =
            intensity_factor.map(|factor| duration_seconds * factor * factor * 100.0 / 3600.0);

        debug!(
            duration_seconds,
            readings = self.readings_count,
            normalized_power = ?normalized_power,
            intensity_factor = ?intensity_factor,
            tss = ?training_stress_score,
            "metrics finalized"
        );

        Ok(MetricsSnapshot {
            duration_seconds,
            wall_seconds: self
                .started_at
                .map(|start| end.saturating_sub(start) as f64 / 1000.0)
                .unwrap_or(0.0),
            rolling_30s_power_avg: self.power.rolling_average(),
            metrics,
            power_zone_seconds: self.track(MetricKind::Power).zone_seconds(),
            heart_rate_zone_seconds: self.track(MetricKind::HeartRate).zone_seconds(),
            normalized_power,
            intensity_factor,
            intensity_basis: intensity.map(|(_, basis)| basis),
            training_stress_score,
            threshold_power: self.profile.ftp(),
            total_distance_m: self.total_distance(),
            readings_count: self.readings_count,
            started_at: self.started_at,
            ended_at: end,
        })
    }
}

/// Rebuild a summary from log entries with a fresh engine
pub fn replay<'a, I>(
    profile: ProfileSnapshot,
    config: &MetricsConfig,
    entries: I,
    end: MonotonicMs,
) -> MetricsResult<MetricsSnapshot>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut engine = MetricsEngine::new(profile, config);
    for entry in entries {
        engine.apply(entry);
    }
    engine.finalize(end)
}
