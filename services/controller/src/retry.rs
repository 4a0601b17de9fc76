//! Retry delays.

use std::time::Duration;

use rand::Rng;

/// Doubling delay schedule, capped at `max`, with optional additive jitter.
///
/// Used for status write conflicts and for work queue retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added at random, clamped to `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Schedule without jitter.
    pub fn exact(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt`, counting from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let fraction = self.jitter.clamp(0.0, 1.0);
        if fraction == 0.0 || delay.is_zero() {
            return delay;
        }
        delay + delay.mul_f64(rand::rng().random_range(0.0..fraction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::exact(Duration::from_millis(5), Duration::from_millis(100));
        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(10), Duration::from_millis(100));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d < Duration::from_millis(300));
        }
    }
}
