//! Read-through tile cache coordinator
//!
//! [`TileCache::resolve`] answers a tile request from the first tier that has
//! it:
//!
//! ```text
//! L1 (LocalStore) -> L2 (DistributedStore) -> origin (through CircuitBreaker)
//! ```
//!
//! L2 hits are promoted into L1 with the TTL the server still holds for them.
//! Origin successes are written to L2 (best effort) and then L1. Origin
//! failures are never cached. Concurrent misses on the same key share one
//! origin fetch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::CacheConfig;
use crate::distributed_store::{DistributedStore, RedisStore, TileRecord};
use crate::error::{CacheError, CircuitError, FetchError, StoreError};
use crate::invalidation::{InvalidationFeed, InvalidationListener, RedisInvalidationFeed};
use crate::key::{CacheKey, KeyBuilder, TileRequest, has_dot_segment};
use crate::local_store::{CacheEntry, LocalStore};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::origin::{OriginGateway, OriginResponse};
use crate::telemetry::SystemMemoryProbe;
use crate::ttl::TtlPolicy;

/// Content type assumed when the origin does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "image/png";

const ERROR_CONTENT_TYPE: &str = "application/json";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    LocalHit,
    RemoteHit,
    Miss,
    UpstreamError,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::LocalHit => "LOCAL_HIT",
            CacheStatus::RemoteHit => "REMOTE_HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::UpstreamError => "UPSTREAM_ERROR",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`TileCache::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub payload: Bytes,
    pub content_type: String,
    pub status: CacheStatus,
    /// Seconds a downstream client may cache the payload
    pub max_age: u64,
    /// HTTP status returned by the origin, when it was contacted
    pub upstream_status: Option<u16>,
}

impl Resolved {
    fn from_entry(entry: CacheEntry, status: CacheStatus, max_age: u64) -> Self {
        Self {
            payload: entry.payload,
            content_type: entry.content_type,
            status,
            max_age,
            upstream_status: None,
        }
    }

    /// JSON error document returned instead of a tile.
    fn upstream_error(error: &str, detail: Option<String>, upstream_status: Option<u16>) -> Self {
        let mut body = serde_json::json!({ "error": error });
        if let Some(detail) = detail {
            body["detail"] = detail.into();
        }
        if let Some(status) = upstream_status {
            body["status"] = status.into();
        }

        Self {
            payload: Bytes::from(body.to_string()),
            content_type: ERROR_CONTENT_TYPE.to_owned(),
            status: CacheStatus::UpstreamError,
            max_age: 0,
            upstream_status,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == CacheStatus::UpstreamError
    }

    /// `Cache-Control` value for the downstream response.
    pub fn cache_control(&self) -> String {
        if self.is_error() {
            return "no-store".to_owned();
        }
        format!("public, max-age={}", self.max_age)
    }

    /// HTTP status for the downstream response: the origin's own error
    /// status when it sent one, 502 when it could not be reached.
    pub fn http_status(&self) -> u16 {
        match (self.status, self.upstream_status) {
            (CacheStatus::UpstreamError, Some(status)) if status >= 400 => status,
            (CacheStatus::UpstreamError, _) => 502,
            _ => 200,
        }
    }
}

/// Responses that count against the origin's health.
fn is_origin_failure(status: u16) -> bool {
    status >= 500 || status == 429
}

type InFlightFetch = watch::Receiver<Option<Resolved>>;
type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlightFetch>>>;

/// Leader's handle on an in-flight fetch.
///
/// Dropping it without [`complete`](Self::complete) (the leader was
/// cancelled or panicked) closes the channel without a value, and waiters
/// elect a new leader.
struct InFlightGuard {
    key: CacheKey,
    in_flight: InFlightMap,
    tx: Option<watch::Sender<Option<Resolved>>>,
}

impl InFlightGuard {
    fn complete(mut self, resolved: Resolved) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(resolved));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // The entry must be gone before `tx` closes so woken waiters can
        // register a new leader.
        self.in_flight.lock().remove(&self.key);
    }
}

enum Role {
    Leader(InFlightGuard),
    Follower(InFlightFetch),
}

struct TileCacheInner<O, S> {
    local: Arc<LocalStore>,
    store: S,
    origin: O,
    breaker: CircuitBreaker,
    ttl: TtlPolicy,
    keys: KeyBuilder,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
    in_flight: InFlightMap,
}

/// Two-tier read-through tile cache.
///
/// Cloning is cheap; clones share every tier, the breaker and the counters.
pub struct TileCache<O, S> {
    inner: Arc<TileCacheInner<O, S>>,
}

impl<O, S> Clone for TileCache<O, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: OriginGateway> TileCache<O, RedisStore> {
    /// Build a cache over Redis, sizing L1 from host memory.
    ///
    /// When `enable_pubsub` is set, the invalidation listener is started and
    /// runs until `shutdown` is cancelled.
    pub async fn connect(
        redis_client: redis::Client,
        config: CacheConfig,
        origin: O,
        shutdown: CancellationToken,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let store = RedisStore::connect(
            &redis_client,
            config.namespace.clone(),
            config.invalidation_channel(),
        )
        .await?;

        if config.listener.configure_keyspace_events {
            if let Err(e) = store.enable_keyspace_events().await {
                warn!(
                    error = %e,
                    "could not enable keyspace notifications; relying on explicit invalidations and TTLs"
                );
            }
        }

        let local = Arc::new(LocalStore::new(
            config.local.clone(),
            Arc::new(SystemMemoryProbe::new()),
        ));
        let cache = Self::new(config, local, store, origin, Arc::new(CacheMetrics::new()))?;

        if cache.inner.config.enable_pubsub {
            let feed = Arc::new(RedisInvalidationFeed::new(
                redis_client,
                cache.inner.config.invalidation_channel(),
            ));
            cache.spawn_listener(feed, shutdown);
        }

        Ok(cache)
    }
}

impl<O: OriginGateway, S: DistributedStore> TileCache<O, S> {
    pub fn new(
        config: CacheConfig,
        local: Arc<LocalStore>,
        store: S,
        origin: O,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(TileCacheInner {
                local,
                store,
                origin,
                breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
                ttl: TtlPolicy::new(&config.ttl),
                keys: KeyBuilder::new(&config.param_whitelist),
                metrics,
                config,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        })
    }

    /// Start an invalidation listener feeding this cache's L1.
    pub fn spawn_listener<F: InvalidationFeed>(
        &self,
        feed: Arc<F>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        InvalidationListener::new(
            feed,
            Arc::clone(&self.inner.local),
            Arc::clone(&self.inner.metrics),
            self.inner.config.namespace.clone(),
            self.inner.config.listener.clone(),
        )
        .spawn(shutdown)
    }

    /// Cache key a request resolves to.
    pub fn key_for(&self, request: &TileRequest) -> CacheKey {
        self.inner.keys.build(request)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Resolve a tile through L1, L2 and the origin.
    ///
    /// Never fails: origin problems come back as [`CacheStatus::UpstreamError`]
    /// with a JSON error payload, and L2 problems are treated as misses.
    pub async fn resolve(&self, request: &TileRequest) -> Resolved {
        let key = self.key_for(request);
        self.inner.metrics.request();

        if let Some(resolved) = self.lookup_local(&key) {
            return resolved;
        }
        if let Some(resolved) = self.lookup_remote(&key).await {
            return resolved;
        }

        if !self.inner.config.coalesce_misses {
            return self.fetch_from_origin(&key, request).await;
        }

        loop {
            let role = {
                let mut in_flight = self.inner.in_flight.lock();
                match in_flight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(key.clone(), rx);
                        Role::Leader(InFlightGuard {
                            key: key.clone(),
                            in_flight: Arc::clone(&self.inner.in_flight),
                            tx: Some(tx),
                        })
                    }
                }
            };

            match role {
                Role::Follower(rx) => match self.wait_for_leader(&key, rx).await {
                    Some(resolved) => return resolved,
                    None => {
                        debug!(key = %key, "in-flight leader abandoned the fetch, re-electing");
                    }
                },
                Role::Leader(guard) => {
                    // A previous leader may have filled L1 after our first lookup
                    if let Some(resolved) = self.lookup_local(&key) {
                        guard.complete(resolved.clone());
                        return resolved;
                    }
                    let resolved = self.fetch_from_origin(&key, request).await;
                    guard.complete(resolved.clone());
                    return resolved;
                }
            }
        }
    }

    /// Evict `key` everywhere: local L1, shared L2 and, through the
    /// invalidation channel, every other instance's L1.
    ///
    /// L2 failures are logged and otherwise ignored.
    pub async fn invalidate(&self, key: &CacheKey) {
        let inner = &self.inner;
        let removed = inner.local.evict(std::iter::once(key));
        debug!(key = %key, removed, "invalidating tile");

        if let Err(e) = self.with_store_timeout(inner.store.delete(key)).await {
            inner.metrics.store_error();
            warn!(key = %key, error = %e, "L2 delete failed during invalidation. Continuing.");
        }

        if inner.config.enable_pubsub {
            let keys = std::slice::from_ref(key);
            if let Err(e) = self
                .with_store_timeout(inner.store.publish_invalidation(keys))
                .await
            {
                inner.metrics.store_error();
                warn!(key = %key, error = %e, "failed to publish invalidation. Continuing.");
            }
        }
    }

    fn lookup_local(&self, key: &CacheKey) -> Option<Resolved> {
        let entry = self.inner.local.get(key)?;
        self.inner.metrics.local_hit();
        debug!(key = %key, "Cache hit L1");

        let max_age = entry.remaining_ttl_secs();
        Some(Resolved::from_entry(entry, CacheStatus::LocalHit, max_age))
    }

    async fn lookup_remote(&self, key: &CacheKey) -> Option<Resolved> {
        let inner = &self.inner;
        let stored = match self.with_store_timeout(inner.store.get_fields(key)).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!(key = %key, "Cache miss L2");
                return None;
            }
            Err(e) => {
                inner.metrics.store_error();
                warn!(key = %key, error = %e, "L2 read failed. Falling back to origin.");
                return None;
            }
        };

        let ttl_secs = match stored.ttl_secs {
            Some(ttl) => inner.ttl.clamp(ttl),
            None => inner.ttl.derive(None),
        };
        let entry = CacheEntry::new(
            stored.record.payload,
            stored.record.content_type,
            Duration::from_secs(ttl_secs),
        );
        inner.local.put(key.clone(), entry.clone());
        inner.metrics.remote_hit();
        debug!(key = %key, ttl_secs, "Cache hit L2, promoted to L1");

        Some(Resolved::from_entry(entry, CacheStatus::RemoteHit, ttl_secs))
    }

    /// The leader's outcome, or `None` when the leader went away without one.
    async fn wait_for_leader(&self, key: &CacheKey, mut rx: InFlightFetch) -> Option<Resolved> {
        self.inner.metrics.coalesced_wait();
        debug!(key = %key, "waiting for in-flight origin fetch");

        loop {
            if let Some(resolved) = rx.borrow().as_ref() {
                return Some(resolved.clone());
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn fetch_from_origin(&self, key: &CacheKey, request: &TileRequest) -> Resolved {
        let inner = &*self.inner;
        let path = request.normalized_path();
        if has_dot_segment(&path) {
            debug!(key = %key, "rejected tile path with dot segments");
            return Resolved::upstream_error("Invalid tile path", None, Some(400));
        }
        let path = path.as_str();
        let params = request.params.as_slice();

        // 4xx answers neither trip nor heal the breaker
        let outcome = inner
            .breaker
            .call_with(
                || async move {
                    inner.metrics.origin_call();
                    match inner.origin.fetch(path, params).await {
                        Ok(response) if is_origin_failure(response.status) => {
                            Err(FetchError::Status(response.status))
                        }
                        other => other,
                    }
                },
                |response: &OriginResponse| response.is_success(),
            )
            .await;

        match outcome {
            Ok(response) if response.is_success() => self.populate(key, response).await,
            Ok(response) => {
                inner.metrics.origin_error();
                warn!(key = %key, status = response.status, "origin rejected tile request");
                Resolved::upstream_error("Upstream request failed", None, Some(response.status))
            }
            Err(CircuitError::Open) => {
                inner.metrics.origin_error();
                debug!(key = %key, "circuit open, origin not contacted");
                Resolved::upstream_error(
                    "Upstream unavailable",
                    Some("circuit breaker is open".to_owned()),
                    None,
                )
            }
            Err(CircuitError::Inner(e)) => {
                inner.metrics.origin_error();
                error!(key = %key, error = %e, "origin fetch failed");
                Resolved::upstream_error("Upstream error", Some(e.to_string()), e.status())
            }
        }
    }

    /// Write a fresh origin response to L2 then L1.
    async fn populate(&self, key: &CacheKey, response: OriginResponse) -> Resolved {
        let inner = &self.inner;
        let ttl_secs = inner.ttl.derive(response.header("cache-control"));
        let record = TileRecord {
            content_type: response
                .header("content-type")
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned(),
            payload: response.body,
        };

        if let Err(e) = self
            .with_store_timeout(inner.store.set_fields_with_ttl(key, &record, ttl_secs))
            .await
        {
            inner.metrics.store_error();
            warn!(key = %key, error = %e, "L2 write failed. Continuing.");
        }

        inner.local.put(
            key.clone(),
            CacheEntry::new(
                record.payload.clone(),
                record.content_type.clone(),
                Duration::from_secs(ttl_secs),
            ),
        );
        debug!(key = %key, ttl_secs, "Cache miss, fetched from origin");

        Resolved {
            payload: record.payload,
            content_type: record.content_type,
            status: CacheStatus::Miss,
            max_age: ttl_secs,
            upstream_status: Some(response.status),
        }
    }

    async fn with_store_timeout<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.inner.config.store_timeout;
        tokio::time::timeout(limit, op).await.map_err(|_| {
            StoreError::Connection(format!("L2 call timed out after {}ms", limit.as_millis()))
        })?
    }
}
