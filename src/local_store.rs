//! In-process (L1) tile store
//!
//! A strict LRU map from [`CacheKey`] to [`CacheEntry`] guarded by a single
//! store-scoped mutex. Reads take the lock too: a hit moves the entry to the
//! most-recently-used position, which mutates the recency list.
//!
//! Capacity is an entry count derived from host memory telemetry:
//! `available_memory * memory_fraction / average_entry_bytes`, clamped to the
//! configured bounds. Telemetry is sampled on a time/write-count interval and
//! the result is reused between samples.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LocalStoreConfig;
use crate::key::CacheKey;
use crate::telemetry::MemoryProbe;

/// A cached tile. `expires_at` is fixed when the entry is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub content_type: String,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(payload: Bytes, content_type: impl Into<String>, ttl: Duration) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Whole seconds left before expiry, never less than one.
    pub fn remaining_ttl_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
            .max(1)
    }
}

/// Bounded LRU tile store.
pub struct LocalStore {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    /// Mirrors the LRU cap; only written while `entries` is locked.
    capacity: AtomicUsize,
    config: LocalStoreConfig,
    probe: Arc<dyn MemoryProbe>,
    last_sample: Mutex<Instant>,
    puts_since_sample: AtomicU64,
    resampling: AtomicBool,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Create a store sized from the probe's current reading.
    pub fn new(config: LocalStoreConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let capacity = compute_capacity(&config, probe.as_ref());
        debug!(capacity, "local store sized");

        Self {
            entries: Mutex::new(LruCache::new(non_zero(capacity))),
            capacity: AtomicUsize::new(capacity),
            config,
            probe,
            last_sample: Mutex::new(Instant::now()),
            puts_since_sample: AtomicU64::new(0),
            resampling: AtomicBool::new(false),
        }
    }

    /// Return the entry for `key` if present and unexpired.
    ///
    /// A hit becomes the most recently used entry. An expired entry is dropped.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            debug!(key = %key, "dropped expired L1 entry");
        }
        None
    }

    /// Insert or overwrite `key`, then evict least-recently-used entries
    /// until the store is within capacity.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        self.maybe_resample();
        // LruCache evicts the LRU entry itself once full
        self.entries.lock().put(key, entry);
    }

    /// Remove the given keys regardless of age. Returns how many were present.
    pub fn evict<'a, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut entries = self.entries.lock();
        keys.into_iter()
            .filter(|key| entries.pop(*key).is_some())
            .count()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Re-read host telemetry and apply the new capacity, shrinking the store
    /// if needed.
    pub fn refresh_capacity(&self) -> usize {
        *self.last_sample.lock() = Instant::now();
        self.puts_since_sample.store(0, Ordering::Relaxed);

        let capacity = compute_capacity(&self.config, self.probe.as_ref());

        let mut entries = self.entries.lock();
        let previous = self.capacity.swap(capacity, Ordering::Relaxed);
        if previous != capacity {
            entries.resize(non_zero(capacity));
            debug!(previous, capacity, "local store resized");
        }
        capacity
    }

    fn maybe_resample(&self) {
        let puts = self.puts_since_sample.fetch_add(1, Ordering::Relaxed) + 1;
        let due = puts >= self.config.sample_every_puts
            || self.last_sample.lock().elapsed() >= self.config.sample_interval;
        if !due {
            return;
        }
        // One writer samples; the rest keep the current capacity
        if self
            .resampling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.refresh_capacity();
            self.resampling.store(false, Ordering::Release);
        }
    }
}

fn compute_capacity(config: &LocalStoreConfig, probe: &dyn MemoryProbe) -> usize {
    let raw = match probe.available_memory_bytes() {
        Ok(available) => {
            let budget = available as f64 * config.memory_fraction;
            (budget / config.average_entry_bytes as f64) as usize
        }
        Err(e) => {
            warn!(
                error = %e,
                fallback = config.fallback_capacity,
                "memory telemetry failed, using fallback capacity"
            );
            config.fallback_capacity
        }
    };
    raw.clamp(config.min_capacity, config.max_capacity)
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}
