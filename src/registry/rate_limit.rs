//! Adaptive rate limiting for registry requests

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Successful requests needed before the rate is raised again
const RECOVERY_STREAK: u32 = 20;

struct LimiterState {
    rate: f64,
    streak: u32,
    limiter: Arc<DirectLimiter>,
}

/// Global limiter that halves its rate when upstream throttles us
///
/// The rate never drops below `min_rate` and climbs back towards
/// `max_rate` after a streak of successful requests.
pub struct AdaptiveRateLimiter {
    max_rate: f64,
    min_rate: f64,
    state: Mutex<LimiterState>,
}

fn build_limiter(rate: f64) -> Arc<DirectLimiter> {
    let period = Duration::from_secs_f64(1.0 / rate.max(f64::EPSILON));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
        .allow_burst(nonzero!(1u32));
    Arc::new(RateLimiter::direct(quota))
}

impl AdaptiveRateLimiter {
    pub fn new(requests_per_second: f64, min_requests_per_second: f64) -> Self {
        let min_rate = min_requests_per_second.max(0.001);
        let max_rate = requests_per_second.max(min_rate);
        Self {
            max_rate,
            min_rate,
            state: Mutex::new(LimiterState {
                rate: max_rate,
                streak: 0,
                limiter: build_limiter(max_rate),
            }),
        }
    }

    /// Wait until a request is allowed
    pub async fn wait(&self) {
        let limiter = self.state.lock().await.limiter.clone();
        limiter.until_ready().await;
    }

    /// Current permitted requests per second
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    /// Upstream signalled rate limiting; halve the rate
    pub async fn slow_down(&self) {
        let mut state = self.state.lock().await;
        let next = (state.rate / 2.0).max(self.min_rate);
        state.streak = 0;
        if next < state.rate {
            info!(from = state.rate, to = next, "Registry throttled us, slowing down");
            state.rate = next;
            state.limiter = build_limiter(next);
        }
    }

    /// A request succeeded
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if state.rate >= self.max_rate {
            return;
        }
        state.streak += 1;
        if state.streak >= RECOVERY_STREAK {
            let next = (state.rate * 2.0).min(self.max_rate);
            debug!(from = state.rate, to = next, "Raising registry request rate");
            state.rate = next;
            state.streak = 0;
            state.limiter = build_limiter(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_down_respects_floor() {
        let limiter = AdaptiveRateLimiter::new(8.0, 1.0);
        for _ in 0..10 {
            limiter.slow_down().await;
        }
        assert_eq!(limiter.current_rate().await, 1.0);
    }

    #[tokio::test]
    async fn test_recovers_after_streak() {
        let limiter = AdaptiveRateLimiter::new(8.0, 1.0);
        limiter.slow_down().await;
        assert_eq!(limiter.current_rate().await, 4.0);
        for _ in 0..RECOVERY_STREAK {
            limiter.record_success().await;
        }
        assert_eq!(limiter.current_rate().await, 8.0);
    }

    #[tokio::test]
    async fn test_wait_allows_requests() {
        let limiter = AdaptiveRateLimiter::new(1000.0, 1.0);
        for _ in 0..5 {
            limiter.wait().await;
        }
    }
}
