//! Bounded exponential backoff shared by the crawler and the supervisor

use crate::config::RetryConfig;
use std::time::Duration;

/// `delay(n) = min(cap, base * factor^n)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            factor: factor.max(1.0),
            cap: cap.max(base),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `retry` (0-based); never decreases as `retry` grows
    pub fn delay(&self, retry: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(retry.min(1024) as i32);
        if !scaled.is_finite() || scaled >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Rate-limited retries wait longer: at least twice the normal delay or the server's hint
    pub fn rate_limited_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let doubled = self.delay(retry).saturating_mul(2);
        retry_after.unwrap_or_default().max(doubled).min(self.cap)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.factor,
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_delays_are_monotonic_and_capped() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(250),
            1.7,
            Duration::from_secs(30),
            8,
        );
        let mut previous = Duration::ZERO;
        for retry in 0..200 {
            let delay = policy.delay(retry);
            assert!(delay >= previous, "retry {} went backwards", retry);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));
    }

    #[test]
    fn test_rate_limited_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.rate_limited_delay(0, None), Duration::from_secs(2));
        assert_eq!(
            policy.rate_limited_delay(0, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.rate_limited_delay(0, Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_allows_bounded_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }
}
