//! Reconnect backoff policy.

use rand::Rng;
use std::time::Duration;

/// Linear, capped reconnect schedule with optional jitter.
///
/// The nominal delay for attempt `n` is `base * n`, capped at `max_delay`.
/// Jitter is drawn from `[0, base)` and the result is clamped to `max_delay`,
/// so consecutive delays never decrease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed before giving up. `0` means unlimited.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// The un-jittered delay before retry number `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    /// The delay to actually sleep before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || self.base_delay.is_zero() {
            return nominal;
        }
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..base_ms.max(1)));
        nominal.saturating_add(jitter).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_used` failures.
    pub fn should_retry(&self, attempts_used: u32) -> bool {
        self.max_attempts == 0 || attempts_used < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter,
        }
    }

    #[test]
    fn test_nominal_schedule() {
        let p = policy(false);
        let delays: Vec<u64> = (1..=8).map(|n| p.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20, 25, 30, 30, 30]);
        assert_eq!(p.delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_schedule_is_monotonic_and_capped() {
        let p = policy(true);
        for _ in 0..200 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=20 {
                let delay = p.delay(attempt);
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay <= p.max_delay);
                assert!(delay >= p.nominal_delay(attempt));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_should_retry_limits() {
        let p = policy(false);
        assert!(p.should_retry(0));
        assert!(p.should_retry(9));
        assert!(!p.should_retry(10));

        let unlimited = ReconnectPolicy {
            max_attempts: 0,
            ..p
        };
        assert!(unlimited.should_retry(u32::MAX));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        assert_eq!(policy(false).delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_near_duration_max_saturates() {
        let p = ReconnectPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::MAX,
            max_attempts: 0,
            jitter: true,
        };
        assert_eq!(p.delay(u32::MAX), Duration::MAX);
    }
}
