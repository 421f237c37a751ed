//! Backoff policy: decides how long a failed task stays invisible.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and uniform jitter:
///
/// `delay(n) = min(base * 2^n, cap) + random(0, jitter)`
///
/// where `n` is the number of attempts already made. The jitter spreads
/// reclaims out after a burst of transient failures (an inference endpoint or
/// search index coming back up) instead of releasing every task at once.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// Delay before attempt `attempt_count + 1` becomes claimable.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt_count.min(32) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64())
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            jitter: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60), Duration::ZERO)
    }

    #[test]
    fn doubles_per_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(8));
        assert_eq!(policy.delay(3), Duration::from_secs(16));
    }

    #[test]
    fn respects_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        // Huge attempt counts must not overflow.
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        for _ in 0..100 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_secs(2));
            assert!(d < Duration::from_secs(3));
        }
    }
}
