//! Per-metric accumulation
//!
//! A reading stays pending until a later timestamp, a pause or finalize
//! arrives, so a duplicate at the same timestamp simply replaces it. Only
//! committed readings touch the running statistics.

use crate::snapshot::MetricSummary;
use crate::zones::ZoneTable;
use pacer_core::MonotonicMs;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pending {
    timestamp: MonotonicMs,
    scalar: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricTrack {
    pending: Option<Pending>,
    /// Timestamp of the previous committed reading in the current segment
    chain: Option<MonotonicMs>,
    count: u64,
    scalar_count: u64,
    sum: f64,
    max: Option<f64>,
    last: Option<f64>,
    active_ms: u64,
    zones: Option<(ZoneTable, Vec<u64>)>,
}

impl MetricTrack {
    pub fn new(zones: Option<ZoneTable>) -> Self {
        Self {
            zones: zones.map(|table| {
                let buckets = vec![0; table.zone_count()];
                (table, buckets)
            }),
            ..Self::default()
        }
    }

    pub fn record(&mut self, timestamp: MonotonicMs, scalar: Option<f64>) {
        match self.pending {
            Some(pending) if timestamp == pending.timestamp => {
                self.pending = Some(Pending { timestamp, scalar });
            }
            Some(pending) if timestamp < pending.timestamp => {}
            Some(pending) => {
                self.commit(pending);
                self.pending = Some(Pending { timestamp, scalar });
            }
            None => {
                self.pending = Some(Pending { timestamp, scalar });
            }
        }
    }

    /// Commit the pending reading and break the elapsed-time chain
    pub fn suspend(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.commit(pending);
        }
        self.chain = None;
    }

    fn commit(&mut self, reading: Pending) {
        let elapsed = self
            .chain
            .map(|previous| reading.timestamp.saturating_sub(previous))
            .unwrap_or(0);
        self.chain = Some(reading.timestamp);
        self.count += 1;
        self.active_ms += elapsed;

        if let Some(value) = reading.scalar {
            self.scalar_count += 1;
            self.sum += value;
            self.max = Some(self.max.map_or(value, |max| max.max(value)));
            self.last = Some(value);
            if let Some((table, buckets)) = self.zones.as_mut() {
                buckets[table.zone_of(value)] += elapsed;
            }
        }
    }

    /// Most recent value, pending or committed
    pub fn current(&self) -> Option<f64> {
        self.pending.and_then(|p| p.scalar).or(self.last)
    }

    /// Zone of the most recent value
    pub fn current_zone(&self) -> Option<usize> {
        let value = self.current()?;
        self.zones.as_ref().map(|(table, _)| table.zone_of(value))
    }

    pub fn has_readings(&self) -> bool {
        self.count > 0 || self.pending.is_some()
    }

    /// Statistics over committed readings
    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            count: self.count,
            avg: (self.scalar_count > 0).then(|| self.sum / self.scalar_count as f64),
            max: self.max,
            active_seconds: self.active_ms as f64 / 1000.0,
        }
    }

    /// Seconds per zone, `None` without a zone table
    pub fn zone_seconds(&self) -> Option<Vec<f64>> {
        self.zones.as_ref().map(|(_, buckets)| {
            buckets
                .iter()
                .map(|ms| *ms as f64 / 1000.0)
                .collect()
        })
    }

    pub fn zone_millis(&self) -> Option<&[u64]> {
        self.zones.as_ref().map(|(_, buckets)| buckets.as_slice())
    }

    pub fn active_ms(&self) -> u64 {
        self.active_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_timestamp_last_write_wins() {
        let mut track = MetricTrack::new(None);
        track.record(1000, Some(120.0));
        track.record(1000, Some(140.0));
        track.record(2000, Some(100.0));
        track.suspend();

        let summary = track.summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.avg, Some(120.0));
        assert_eq!(summary.max, Some(140.0));
        assert_eq!(summary.active_seconds, 1.0);
    }

    #[test]
    fn test_elapsed_time_goes_to_zone_of_reading() {
        let table = ZoneTable::from_fractions(100.0, &[1.0]);
        let mut track = MetricTrack::new(Some(table));
        track.record(0, Some(50.0));
        track.record(3000, Some(150.0));
        track.record(4000, Some(50.0));
        track.suspend();

        assert_eq!(track.zone_millis().unwrap(), &[1000, 3000]);
        assert_eq!(track.active_ms(), 4000);
    }

    #[test]
    fn test_suspend_breaks_chain() {
        let table = ZoneTable::from_fractions(100.0, &[1.0]);
        let mut track = MetricTrack::new(Some(table));
        track.record(0, Some(50.0));
        track.record(1000, Some(50.0));
        track.suspend();
        track.record(120_000, Some(50.0));
        track.record(121_000, Some(50.0));
        track.suspend();

        let total: u64 = track.zone_millis().unwrap().iter().sum();
        assert_eq!(total, 2000);
        assert_eq!(track.summary().count, 4);
    }

    #[test]
    fn test_pending_is_current_but_not_counted() {
        let mut track = MetricTrack::new(None);
        track.record(0, Some(90.0));
        assert_eq!(track.current(), Some(90.0));
        assert!(track.has_readings());
        assert_eq!(track.summary().count, 0);
    }
}
