//! Exponential backoff with jitter.
//!
//! [`BackoffPolicy`] is the stateless form used for job retries, where the
//! attempt number is stored on the job. [`ExponentialBackoff`] wraps it with
//! an attempt counter for reconnect loops.

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;

/// delay(n) = base * 2^(n-1), capped at max, plus jitter in [0, delay * jitter_factor]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(base_delay_ms.max(1)),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.base_delay_ms,
            settings.max_delay_ms,
            settings.jitter_factor,
        )
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Delay before jitter for the given 1-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay including jitter for the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }

        let jitter_range = base.as_millis() as f64 * self.jitter_factor;
        let jitter = rand::rng().random_range(0.0..=jitter_range);
        base + Duration::from_millis(jitter as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Stateful backoff for reconnect loops.
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles() {
        let policy = BackoffPolicy::new(100, 60_000, 0.0);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_base_delay_is_monotonic_and_capped() {
        let policy = BackoffPolicy::new(250, 5_000, 0.1);
        let mut previous = Duration::ZERO;
        for attempt in 1..=80 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            assert!(delay <= Duration::from_millis(5_000));
            previous = delay;
        }
        assert_eq!(policy.base_delay(80), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy::new(1_000, 60_000, 0.1);
        for attempt in 1..=6 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base + base / 10);
            }
        }
    }

    #[test]
    fn test_zero_attempt_treated_as_first() {
        let policy = BackoffPolicy::new(100, 1_000, 0.0);
        assert_eq!(policy.base_delay(0), policy.base_delay(1));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(BackoffPolicy::new(10, 1_000, 0.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
