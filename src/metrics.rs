//! Cache counters.
//!
//! Lock-free atomic counters written by the coordinator and read by reporting
//! code through a point-in-time [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    requests: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    origin_calls: AtomicU64,
    origin_errors: AtomicU64,
    store_errors: AtomicU64,
    coalesced_waits: AtomicU64,
    invalidated_keys: AtomicU64,
}

/// Copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub origin_calls: u64,
    pub origin_errors: u64,
    pub store_errors: u64,
    pub coalesced_waits: u64,
    pub invalidated_keys: u64,
}

impl MetricsSnapshot {
    /// Share of requests answered from L1 or L2.
    pub fn hit_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        (self.local_hits + self.remote_hits) as f64 / self.requests as f64
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remote_hit(&self) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn origin_call(&self) {
        self.origin_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn origin_error(&self) {
        self.origin_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn keys_invalidated(&self, count: u64) {
        self.invalidated_keys.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            origin_calls: self.origin_calls.load(Ordering::Relaxed),
            origin_errors: self.origin_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            invalidated_keys: self.invalidated_keys.load(Ordering::Relaxed),
        }
    }
}
