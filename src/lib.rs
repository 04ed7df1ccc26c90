//! tilecache - Read-through two-tier cache for map tiles
//!
//! This library fronts a slow tile origin with two cache tiers:
//! - L1: In-process LRU sized from host memory (fastest)
//! - L2: Redis hashes with a TTL (shared across instances)
//! - Origin: Pluggable upstream fetcher guarded by a circuit breaker
//!
//! The cache supports:
//! - TTLs derived from the origin's `Cache-Control: max-age`
//! - Redis keyspace notifications and pub/sub for cross-instance L1 invalidation
//! - Request coalescing for concurrent misses on the same tile
//! - Lock-free hit/miss/error counters

mod circuit_breaker;
mod config;
mod coordinator;
mod distributed_store;
mod error;
mod invalidation;
mod key;
mod local_store;
mod metrics;
mod origin;
mod telemetry;
mod ttl;

#[cfg(test)]
mod testing;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{
    CacheConfig, CircuitBreakerConfig, DEFAULT_PARAM_WHITELIST, ListenerConfig, LocalStoreConfig,
    TtlConfig,
};
pub use coordinator::{CacheStatus, DEFAULT_CONTENT_TYPE, Resolved, TileCache};
pub use distributed_store::{
    DistributedStore, KEYSPACE_EVENTS, RedisStore, StoredTile, TileRecord, format_key,
};
pub use error::{CacheError, CircuitError, ConfigError, FetchError, StoreError, TelemetryError};
pub use invalidation::{
    InvalidationBatch, InvalidationFeed, InvalidationListener, InvalidationStream,
    RedisInvalidationFeed, decode_message,
};
pub use key::{CacheKey, KeyBuilder, TileRequest, has_dot_segment, normalize_path};
pub use local_store::{CacheEntry, LocalStore};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use origin::{HttpOrigin, OriginConfig, OriginGateway, OriginResponse};
pub use telemetry::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use ttl::{TtlPolicy, parse_max_age};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
// Listener shutdown handle
pub use tokio_util::sync::CancellationToken;
