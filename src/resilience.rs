// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff and intake throttling.
//!
//! Two loops in the puller wait between attempts: a revision fetch that hit
//! a transient error, and a change feed that dropped its connection. Both use
//! [`RetryConfig`], built from [`FetchConfig`](crate::config::FetchConfig)
//! and [`TrackerConfig`](crate::config::TrackerConfig) respectively.
//!
//! ```text
//! fetch   (defaults)  attempt 1 ─500ms─▶ 2 ─1s─▶ 3 ─2s─▶ 4 ─4s─▶ 5 ─▶ dropped
//! tracker (defaults)  drop 1 ─1s─▶ 2 ─2s─▶ ... capped at 5m, fatal after 100
//! ```
//!
//! [`RateLimiter`] optionally caps how fast changes are taken off the feed,
//! so a huge backlog cannot flood the queues faster than they drain.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff with a ceiling and an attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts allowed, counting the first.
    pub max_attempts: usize,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth per failed attempt.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether attempt number `attempt` (1-indexed) may run.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts
    }
}

// =============================================================================
// Change intake throttling
// =============================================================================

/// Token bucket for change intake: `per_second` refill, `burst` capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub burst: u32,
}

/// Governor-backed limiter, one token per change.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Zero rates are clamped to one.
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_default_fetch_schedule() {
        let retry = RetryConfig::default();
        let waits: Vec<u64> = (1..5).map(|a| retry.delay_for_attempt(a).as_millis() as u64).collect();
        assert_eq!(waits, vec![500, 1000, 2000, 4000]);
        assert!(retry.allows_attempt(5));
        assert!(!retry.allows_attempt(6));
    }

    #[test]
    fn test_delay_capped() {
        let retry = policy(1000, 30_000, 10);
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(retry.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_waits_initial_delay() {
        assert_eq!(policy(250, 1000, 3).delay_for_attempt(0), Duration::from_millis(250));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let retry = policy(10, 10, 1);
        assert!(retry.allows_attempt(1));
        assert!(!retry.allows_attempt(2));
    }

    #[test]
    fn test_rate_limiter_burst_then_empty() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 1,
            burst: 3,
        });
        assert!((0..3).all(|_| limiter.try_acquire()));
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_zero_is_clamped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 0,
            burst: 0,
        });
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_rate_limiter_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 1000,
            burst: 1,
        });
        limiter.acquire().await;
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
