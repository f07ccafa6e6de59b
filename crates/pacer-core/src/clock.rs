//! Clocks used to timestamp commands and map readings onto wall time

use crate::reading::MonotonicMs;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic clock
    fn now_ms(&self) -> MonotonicMs;

    /// Current wall-clock time
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Monotonic clock counting from its creation
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> MonotonicMs {
        self.start.elapsed().as_millis() as MonotonicMs
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays
///
/// Wall time is `base + now_ms`, so both clocks advance together.
#[derive(Debug)]
pub struct ManualClock {
    base: DateTime<Utc>,
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            now_ms: AtomicU64::new(0),
        }
    }

    pub fn set(&self, ms: MonotonicMs) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) -> MonotonicMs {
        self.now_ms.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> MonotonicMs {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.base + Duration::milliseconds(self.now_ms() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_views() {
        let base = Utc::now();
        let clock = ManualClock::new(base);
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.advance(1500), 1500);
        assert_eq!(clock.now_utc(), base + Duration::milliseconds(1500));
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
