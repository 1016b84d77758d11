//! Concurrency-safe TTL cache with per-key single-flight
//!
//! Used to front registry platform lookups and www-authenticate tokens.
//! Values are cached with an expiry instant; errors are never cached.

use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, Opts};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expiry: Instant,
}

pub struct Cache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    // Per-key mutexes serialise concurrent misses on the same key without
    // blocking readers of other keys.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cleanup_access: Mutex<Option<Instant>>,
    cache_duration: Duration,
    cleanup_period: Duration,
}

impl<T: Clone> Cache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            cleanup_access: Mutex::new(None),
            cache_duration,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
        }
    }

    pub fn with_cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = period;
        self
    }

    /// Returns the cached value for the key when present and not expired.
    pub fn load(&self, cache_key: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(cache_key) {
            if Instant::now() < entry.expiry {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Stores a value with the default TTL.
    pub fn store(&self, cache_key: &str, value: T) {
        self.store_with_expiry(cache_key, value, Instant::now() + self.cache_duration);
    }

    /// Stores a value with an explicit expiry instant.
    pub fn store_with_expiry(&self, cache_key: &str, value: T, expiry: Instant) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(cache_key.to_string(), CacheEntry { value, expiry });
    }

    /// Single-flight miss path: concurrent calls for the same key serialise,
    /// the first one invokes `miss`, the others observe the stored value.
    /// A failed `miss` leaves the cache empty for the key.
    ///
    /// Returns the value and whether it was served from the cache.
    pub async fn load_or_call<F, Fut>(&self, cache_key: &str, miss: F) -> Result<(T, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(cache_key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(value) = self.load(cache_key) {
            return Ok((value, true));
        }
        let value = miss().await?;
        self.store(cache_key, value.clone());
        Ok((value, false))
    }

    /// Removes expired entries and their companion locks. A no-op when called
    /// within `cleanup_period` of the previous sweep; sweeps are serialised.
    pub fn clean_up(&self, now: Instant) {
        let mut last_cleanup = self.cleanup_access.lock().unwrap();
        if let Some(last) = *last_cleanup {
            if now < last + self.cleanup_period {
                debug!(
                    cleanup_period_secs = self.cleanup_period.as_secs(),
                    "not enough time passed since last cleanup, skipping"
                );
                return;
            }
        }
        let expired: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, entry)| now > entry.expiry)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !expired.is_empty() {
            let mut entries = self.entries.lock().unwrap();
            let mut locks = self.locks.lock().unwrap();
            for key in &expired {
                debug!(key = key.as_str(), "cleaning up expired cache entry");
                entries.remove(key);
                locks.remove(key);
            }
        }
        *last_cleanup = Some(now);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub struct CacheMetrics {
    pub requests: IntCounter,
    pub responses: IntCounterVec,
}

impl CacheMetrics {
    pub fn new(prefix: &str, system: &str, registry: &prometheus::Registry) -> Result<Self> {
        let requests = IntCounter::with_opts(
            Opts::new(
                "cache_requests_total",
                format!("Number of requests to the {} cache", system),
            )
            .namespace(prefix)
            .subsystem(system),
        )?;
        let responses = IntCounterVec::new(
            Opts::new(
                "cache_responses_total",
                format!("Number of request responses from the {} cache", system),
            )
            .namespace(prefix)
            .subsystem(system),
            &["cache"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(responses.clone()))?;
        Ok(Self { requests, responses })
    }
}
