//! Concurrent bucket storage.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::bucket::{Bucket, Limit};
use super::key::BucketKey;

/// Sharded map from key to bucket.
///
/// A bucket is only read or written while its shard entry is held, so two
/// checks on the same key are serialized and keys on other shards proceed
/// in parallel.
#[derive(Default)]
pub struct KeyStore {
    buckets: DashMap<BucketKey, Bucket>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Run `f` with exclusive access to the bucket for `key`, creating a
    /// full bucket on first use.
    pub fn with_bucket<F, T>(&self, key: &BucketKey, limit: &Limit, now: Instant, f: F) -> T
    where
        F: FnOnce(&mut Bucket) -> T,
    {
        // Look up by reference first so the hot path does not clone the key.
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return f(bucket.value_mut());
        }

        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                rate = limit.rate(),
                burst = limit.burst(),
                unit = %limit.unit(),
                "Creating new bucket"
            );
            Bucket::full(limit, now)
        });
        f(bucket.value_mut())
    }

    /// Remove buckets that have not been touched for `retention`.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, now: Instant, retention: Duration) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = now.saturating_duration_since(bucket.last_refill()) < retention;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Current token balance for `key`, if a bucket exists.
    pub fn tokens(&self, key: &BucketKey) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.tokens())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::Unit;
    use std::sync::Arc;

    fn limit() -> Limit {
        Limit::new(1, 3, Unit::Second).unwrap()
    }

    #[test]
    fn test_creates_full_bucket_once() {
        let store = KeyStore::new();
        let key = BucketKey::new("GET /api", "10.0.0.1");
        let now = Instant::now();

        let tokens = store.with_bucket(&key, &limit(), now, |b| b.tokens());
        assert_eq!(tokens, 3.0);

        store.with_bucket(&key, &limit(), now, |b| b.consume(&limit(), now));
        assert_eq!(store.tokens(&key), Some(2.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evict_idle() {
        let store = KeyStore::new();
        let start = Instant::now();
        let old = BucketKey::new("GET /api", "10.0.0.1");
        let fresh = BucketKey::new("GET /api", "10.0.0.2");

        store.with_bucket(&old, &limit(), start, |b| b.consume(&limit(), start));
        let later = start + Duration::from_secs(30);
        store.with_bucket(&fresh, &limit(), later, |b| b.consume(&limit(), later));

        let removed = store.evict_idle(later + Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(removed, 1);
        assert_eq!(store.tokens(&old), None);
        assert!(store.tokens(&fresh).is_some());
    }

    #[test]
    fn test_evict_count_ignores_concurrent_inserts() {
        let store = Arc::new(KeyStore::new());
        let start = Instant::now();
        for i in 0..500 {
            let key = BucketKey::new("GET /api", format!("10.0.{}.{}", i / 256, i % 256));
            store.with_bucket(&key, &limit(), start, |b| b.tokens());
        }

        let later = start + Duration::from_secs(60);
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let key = BucketKey::new("GET /api", format!("172.16.{}.{}", i / 256, i % 256));
                    store.with_bucket(&key, &limit(), later, |b| b.tokens());
                }
            })
        };

        let removed = store.evict_idle(later, Duration::from_secs(10));
        writer.join().unwrap();

        assert_eq!(removed, 500);
        assert_eq!(store.len(), 500);
    }

    #[test]
    fn test_evicted_key_recreated_full() {
        let store = KeyStore::new();
        let start = Instant::now();
        let key = BucketKey::new("GET /api", "10.0.0.1");

        for _ in 0..3 {
            store.with_bucket(&key, &limit(), start, |b| b.consume(&limit(), start));
        }
        assert_eq!(store.tokens(&key), Some(0.0));

        let later = start + Duration::from_secs(60);
        store.evict_idle(later, Duration::from_secs(10));
        assert!(store.is_empty());

        let tokens = store.with_bucket(&key, &limit(), later, |b| b.tokens());
        assert_eq!(tokens, 3.0);
    }

    #[test]
    fn test_concurrent_first_access_shares_bucket() {
        let store = Arc::new(KeyStore::new());
        let key = BucketKey::new("GET /api", "10.0.0.1");
        let limit = Limit::new(1, 100, Unit::Day).unwrap();
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| store.with_bucket(&key, &limit, now, |b| b.consume(&limit, now)))
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // No lost updates: 80 consumes out of one shared bucket of 100
        assert_eq!(allowed, 80);
        assert_eq!(store.len(), 1);
        assert_eq!(store.tokens(&key), Some(20.0));
    }
}
