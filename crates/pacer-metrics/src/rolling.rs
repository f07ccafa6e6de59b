//! Rolling power and Normalized Power
//!
//! Power is resampled to 1 Hz. Within a second the last reading wins. Gaps
//! between readings of one recording segment are filled by holding the last
//! value; a pause closes the segment so the hold never spans it.

use pacer_core::MonotonicMs;

/// Seconds in the rolling power window
pub const WINDOW_SECONDS: usize = 30;

/// Fixed-size circular buffer with a running sum
#[derive(Debug, Clone)]
pub struct RollingWindow<const N: usize> {
    samples: [f64; N],
    next: usize,
    len: usize,
    sum: f64,
}

impl<const N: usize> Default for RollingWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RollingWindow<N> {
    pub fn new() -> Self {
        Self {
            samples: [0.0; N],
            next: 0,
            len: 0,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.len == N {
            self.sum -= self.samples[self.next];
        } else {
            self.len += 1;
        }
        self.samples[self.next] = value;
        self.sum += value;
        self.next = (self.next + 1) % N;
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn average(&self) -> Option<f64> {
        if self.len == 0 {
            None
        } else {
            Some(self.sum / self.len as f64)
        }
    }
}

/// 1 Hz power resampler feeding the rolling window and the NP accumulator
#[derive(Debug, Clone, Default)]
pub struct PowerSeries {
    window: RollingWindow<WINDOW_SECONDS>,
    /// Open second and its latest value
    pending: Option<(u64, f64)>,
    /// Last closed second of the current segment, eligible for hold
    held: Option<(u64, f64)>,
    fourth_power_sum: f64,
    /// Seconds contributed to the fourth-power sum, warm-up included
    seconds: u64,
}

impl PowerSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, timestamp: MonotonicMs, watts: f64) {
        let second = timestamp / 1000;
        match self.pending {
            Some((open, _)) if second == open => {
                self.pending = Some((open, watts));
            }
            Some((open, _)) if second < open => {
                // Late reading for an already closed second
            }
            Some(_) => {
                self.close_pending();
                self.fill_gap(second);
                self.pending = Some((second, watts));
            }
            None => {
                self.fill_gap(second);
                self.pending = Some((second, watts));
            }
        }
    }

    /// Close the open second and end the segment
    pub fn suspend(&mut self) {
        self.close_pending();
        self.held = None;
    }

    /// Close the open second without ending the segment
    pub fn flush(&mut self) {
        self.close_pending();
    }

    fn close_pending(&mut self) {
        if let Some((second, watts)) = self.pending.take() {
            self.push_second(watts);
            self.held = Some((second, watts));
        }
    }

    fn fill_gap(&mut self, until: u64) {
        let Some((last, watts)) = self.held else {
            return;
        };
        let missing = until.saturating_sub(last + 1);
        // Once the window is saturated with the held value every further
        // second contributes the same fourth power.
        let explicit = missing.min(WINDOW_SECONDS as u64);
        for _ in 0..explicit {
            self.push_second(watts);
        }
        let rest = missing - explicit;
        if rest > 0 {
            self.fourth_power_sum += rest as f64 * watts.powi(4);
            self.seconds += rest;
        }
    }

    /// Every second counts from the first sample on; before the window
    /// fills its average spans the samples seen so far.
    fn push_second(&mut self, watts: f64) {
        self.window.push(watts);
        if let Some(avg) = self.window.average() {
            self.fourth_power_sum += avg.powi(4);
            self.seconds += 1;
        }
    }

    /// Average of the samples currently in the window
    pub fn rolling_average(&self) -> Option<f64> {
        self.window.average()
    }

    /// Normalized Power, absent until one window's worth of seconds exists
    pub fn normalized_power(&self) -> Option<f64> {
        if self.seconds < WINDOW_SECONDS as u64 {
            return None;
        }
        Some((self.fourth_power_sum / self.seconds as f64).powf(0.25))
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }
}
