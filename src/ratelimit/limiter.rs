//! Core rate limiter implementation.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::bucket::Limit;
use super::key::BucketKey;
use super::store::KeyStore;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed
    pub retry_after: Duration,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn reject(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// The core rate limiter that manages token buckets.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Each instance owns its own bucket store, so independent limiters never
/// observe each other's traffic.
#[derive(Default)]
pub struct RateLimiter {
    store: KeyStore,
}

impl RateLimiter {
    /// Create a new rate limiter with an empty store.
    pub fn new() -> Self {
        Self {
            store: KeyStore::new(),
        }
    }

    /// Take one token from the bucket for `key`.
    pub fn check(&self, key: &BucketKey, limit: &Limit) -> Decision {
        self.check_at(key, limit, Instant::now())
    }

    /// Take one token from the bucket for `key` as of `now`.
    ///
    /// The consume and the retry-after calculation run under the same
    /// lock, so the reported wait matches the state that rejected the
    /// request.
    pub fn check_at(&self, key: &BucketKey, limit: &Limit, now: Instant) -> Decision {
        trace!(key = %key, "Checking rate limit");

        let decision = self.store.with_bucket(key, limit, now, |bucket| {
            if bucket.consume(limit, now) {
                Decision::allow()
            } else {
                Decision::reject(bucket.retry_after(limit, now))
            }
        });

        if !decision.allowed {
            debug!(
                key = %key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// Check every key, consuming from each.
    ///
    /// The request is allowed only if every key allows it; a rejection
    /// carries the longest wait among the rejecting keys.
    pub fn check_all_at(&self, keys: &[BucketKey], limit: &Limit, now: Instant) -> Decision {
        keys.iter()
            .map(|key| self.check_at(key, limit, now))
            .fold(Decision::allow(), |acc, decision| {
                if decision.allowed {
                    acc
                } else if acc.allowed {
                    decision
                } else {
                    Decision::reject(acc.retry_after.max(decision.retry_after))
                }
            })
    }

    /// Drop buckets idle for longer than `retention`.
    pub fn evict_idle(&self, retention: Duration) -> usize {
        self.evict_idle_at(Instant::now(), retention)
    }

    pub fn evict_idle_at(&self, now: Instant, retention: Duration) -> usize {
        self.store.evict_idle(now, retention)
    }

    /// Get the current token balance for a key.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &BucketKey) -> Option<f64> {
        self.store.tokens(key)
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Get the number of tracked keys.
    pub fn bucket_count(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::Unit;
    use std::sync::Arc;

    fn key(client: &str) -> BucketKey {
        BucketKey::new("GET /api", client)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(3, 4, Unit::Minute).unwrap();
        let now = Instant::now();

        for _ in 0..4 {
            assert!(limiter.check_at(&key("a"), &limit, now).allowed);
        }

        let decision = limiter.check_at(&key("a"), &limit, now);
        assert!(!decision.allowed);
        assert!(decision.retry_after > Duration::ZERO);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_two_per_second_scenario() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(2, 2, Unit::Second).unwrap();
        let now = Instant::now();

        let outcomes: Vec<bool> = (0..3)
            .map(|_| limiter.check_at(&key("a"), &limit, now).allowed)
            .collect();
        assert_eq!(outcomes, vec![true, true, false]);

        let decision = limiter.check_at(&key("a"), &limit, now);
        assert_eq!(decision.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn test_one_token_after_interval() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(5, 2, Unit::Second).unwrap();
        let start = Instant::now();

        assert!(limiter.check_at(&key("a"), &limit, start).allowed);
        assert!(limiter.check_at(&key("a"), &limit, start).allowed);
        assert!(!limiter.check_at(&key("a"), &limit, start).allowed);

        let later = start + limit.token_interval();
        assert!(limiter.check_at(&key("a"), &limit, later).allowed);
        assert!(!limiter.check_at(&key("a"), &limit, later).allowed);
    }

    #[test]
    fn test_retry_after_elapsed_succeeds() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 1, Unit::Second).unwrap();
        let start = Instant::now();

        assert!(limiter.check_at(&key("a"), &limit, start).allowed);
        let rejected = limiter.check_at(&key("a"), &limit, start);
        assert!(!rejected.allowed);

        assert!(limiter.check_at(&key("a"), &limit, start + rejected.retry_after).allowed);
    }

    #[test]
    fn test_early_retry_wait_shrinks() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 1, Unit::Second).unwrap();
        let start = Instant::now();

        assert!(limiter.check_at(&key("a"), &limit, start).allowed);
        let first = limiter.check_at(&key("a"), &limit, start);

        let elapsed = Duration::from_millis(300);
        let second = limiter.check_at(&key("a"), &limit, start + elapsed);
        assert!(!second.allowed);
        assert!(second.retry_after <= first.retry_after - elapsed + Duration::from_micros(1));
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 1, Unit::Hour).unwrap();
        let now = Instant::now();

        assert!(limiter.check_at(&key("a"), &limit, now).allowed);
        assert!(!limiter.check_at(&key("a"), &limit, now).allowed);
        assert!(limiter.check_at(&key("b"), &limit, now).allowed);
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_concurrent_keys_are_isolated() {
        let limiter = Arc::new(RateLimiter::new());
        let limit = Limit::new(1, 5, Unit::Day).unwrap();
        let now = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let key = key(&format!("client-{}", i));
                    (0..20)
                        .filter(|_| limiter.check_at(&key, &limit, now).allowed)
                        .count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
    }

    #[test]
    fn test_check_all_uses_longest_wait() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 1, Unit::Second).unwrap();
        let start = Instant::now();

        // Drain "a" early and "b" later so their waits differ
        assert!(limiter.check_at(&key("a"), &limit, start).allowed);
        let later = start + Duration::from_millis(600);
        assert!(limiter.check_at(&key("b"), &limit, later).allowed);

        let keys = vec![key("a"), key("b")];
        let decision = limiter.check_all_at(&keys, &limit, later);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn test_check_all_allows_when_all_allow() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 2, Unit::Second).unwrap();
        let keys = vec![key("a"), key("b")];

        let decision = limiter.check_all_at(&keys, &limit, Instant::now());
        assert_eq!(decision, Decision::allow());
        assert_eq!(limiter.tokens(&key("a")), Some(1.0));
        assert_eq!(limiter.tokens(&key("b")), Some(1.0));
    }

    #[test]
    fn test_evict_and_clear() {
        let limiter = RateLimiter::new();
        let limit = Limit::new(1, 1, Unit::Second).unwrap();
        let start = Instant::now();

        limiter.check_at(&key("a"), &limit, start);
        limiter.check_at(&key("b"), &limit, start + Duration::from_secs(10));

        let removed = limiter.evict_idle_at(start + Duration::from_secs(11), Duration::from_secs(5));
        assert_eq!(removed, 1);
        assert_eq!(limiter.bucket_count(), 1);

        limiter.clear();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
