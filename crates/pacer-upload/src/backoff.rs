//! Exponential backoff between upload attempts

use pacer_core::config::UploadConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// `min(base * 2^(attempt - 1), max)` for the attempt that just failed
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Backoff plus up to `jitter_ratio` of it at random
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter_ratio * rng.random::<f64>());
        delay + extra
    }

    /// Whether `attempts` failed attempts exhaust the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter_ratio,
        }
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let policy = policy(0.0);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = policy(0.1);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=6 {
            let base = policy.delay(attempt);
            let jittered = policy.delay_with_jitter(attempt, &mut rng);
            assert!(jittered >= base);
            assert!(jittered <= base.mul_f64(1.1));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = policy(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay_with_jitter(3, &mut rng), Duration::from_secs(4));
    }

    #[test]
    fn test_exhaustion() {
        let policy = policy(0.0);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
