//! Fixed-window rate limiting.

use std::{sync::Arc, time::Duration};

use stowage_core::{SharedClock, SystemClock};
use tracing::warn;

use crate::{CacheOptions, KeyCache, SharedStore, metrics::record_rate_limit_denied};

/// Namespace the window counters are written under.
pub const NAMESPACE: &str = "ratelimit";

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u64,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

/// Fixed-window counter per identifier.
///
/// The counter key is `<identifier>:<floor(now / window)>`, so windows are
/// aligned to the epoch and independent of each other. Bursts straddling a
/// boundary can reach twice the limit.
///
/// The limiter fails open: when the store cannot be read or written the
/// request is allowed and a warning is logged.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: KeyCache,
    window: Duration,
    max_requests: u64,
    clock: SharedClock,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` per `window`.
    pub fn new(store: SharedStore, window: Duration, max_requests: u64) -> Self {
        Self {
            cache: KeyCache::new(store, NAMESPACE),
            window: window.max(Duration::from_millis(1)),
            max_requests,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock windows are computed from.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Counts a request for `identifier` and decides whether it may proceed.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        let now = self.clock.now_millis();
        let key = format!("{identifier}:{}", now.div_euclid(window_ms));
        let reset_after =
            Duration::from_millis((window_ms - now.rem_euclid(window_ms)).unsigned_abs());
        let fail_open = RateLimitDecision {
            allowed: true,
            remaining: self.max_requests.saturating_sub(1),
            reset_after,
        };

        let current = match self.cache.try_get::<u64>(&key).await {
            Ok(count) => count.unwrap_or(0),
            Err(err) => {
                warn!(identifier, error = %err, "rate limiter failed, allowing request");
                return fail_open;
            }
        };

        if current >= self.max_requests {
            record_rate_limit_denied();
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            };
        }

        let next = current + 1;
        if let Err(err) = self
            .cache
            .try_set(&key, &next, CacheOptions::ttl(self.window))
            .await
        {
            warn!(identifier, error = %err, "rate limiter failed, allowing request");
            return fail_open;
        }

        RateLimitDecision {
            allowed: true,
            remaining: self.max_requests - next,
            reset_after,
        }
    }

    /// Whether a request for `identifier` may proceed.
    pub async fn can_make_request(&self, identifier: &str) -> bool {
        self.check(identifier).await.allowed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stowage_core::ManualClock;
    use stowage_memory::{FailingStore, MemoryStore};

    use super::*;

    fn limiter(window: Duration, max: u64) -> (RateLimiter, ManualClock) {
        // Start on a minute boundary.
        let clock = ManualClock::at_millis(1_699_999_980_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(store, window, max).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn denies_after_max_and_resets_next_window() {
        let (limiter, clock) = limiter(Duration::from_secs(1), 3);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.can_make_request("user-1").await);
        }
        assert_eq!(results, vec![true, true, true, false]);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.can_make_request("user-1").await);
    }

    #[tokio::test]
    async fn identifiers_are_counted_separately() {
        let (limiter, _) = limiter(Duration::from_secs(60), 1);

        assert!(limiter.can_make_request("10.0.0.1").await);
        assert!(!limiter.can_make_request("10.0.0.1").await);
        assert!(limiter.can_make_request("10.0.0.2").await);
    }

    #[tokio::test]
    async fn decision_reports_remaining_and_reset() {
        let (limiter, clock) = limiter(Duration::from_secs(60), 2);
        clock.advance(Duration::from_secs(15));

        let first = limiter.check("k").await;
        assert_eq!(
            first,
            RateLimitDecision {
                allowed: true,
                remaining: 1,
                reset_after: Duration::from_secs(45),
            }
        );
        assert_eq!(limiter.check("k").await.remaining, 0);
        let denied = limiter.check("k").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), Duration::from_secs(1), 1);
        for _ in 0..5 {
            assert!(limiter.can_make_request("user-1").await);
        }
    }
}
