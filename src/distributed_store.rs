//! Shared (L2) tile store
//!
//! Each tile is one Redis hash under `<namespace><cache key>` with two fields,
//! the binary payload (`b`) and the content type (`ct`), and a single TTL on
//! the whole hash. Both fields and the TTL are written in one MULTI/EXEC
//! transaction, so readers never see a payload without its content type or a
//! record without an expiry.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::invalidation::InvalidationBatch;
use crate::key::CacheKey;

pub const PAYLOAD_FIELD: &str = "b";
pub const CONTENT_TYPE_FIELD: &str = "ct";

/// Keyspace events Redis must emit for the invalidation listener:
/// keyspace channel, generic commands (DEL, EXPIRE), expired and evicted.
pub const KEYSPACE_EVENTS: &str = "Kgxe";

/// Fixed-schema L2 record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub payload: Bytes,
    pub content_type: String,
}

/// A record read back from L2, with the TTL the server still holds for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTile {
    pub record: TileRecord,
    pub ttl_secs: Option<u64>,
}

/// Shared cache tier addressed fleet-wide.
///
/// Implementations apply their own namespace to every key.
#[async_trait]
pub trait DistributedStore: Send + Sync + 'static {
    /// Read a record. A missing key is `Ok(None)`.
    async fn get_fields(&self, key: &CacheKey) -> Result<Option<StoredTile>, StoreError>;

    /// Write both fields and the TTL as one atomic operation.
    async fn set_fields_with_ttl(
        &self,
        key: &CacheKey,
        record: &TileRecord,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Announce invalidated keys to every instance sharing the store.
    async fn publish_invalidation(&self, keys: &[CacheKey]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: DistributedStore + ?Sized> DistributedStore for Arc<S> {
    async fn get_fields(&self, key: &CacheKey) -> Result<Option<StoredTile>, StoreError> {
        (**self).get_fields(key).await
    }

    async fn set_fields_with_ttl(
        &self,
        key: &CacheKey,
        record: &TileRecord,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        (**self).set_fields_with_ttl(key, record, ttl_secs).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn publish_invalidation(&self, keys: &[CacheKey]) -> Result<(), StoreError> {
        (**self).publish_invalidation(keys).await
    }
}

/// Namespaced key as stored in Redis.
pub fn format_key(namespace: &str, key: &CacheKey) -> String {
    format!("{}{}", namespace, key)
}

/// Redis-backed [`DistributedStore`].
#[derive(Clone)]
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
    namespace: String,
    channel: String,
}

impl RedisStore {
    /// Connect using a managed (auto-reconnecting) connection.
    pub async fn connect(
        redis_client: &redis::Client,
        namespace: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let redis = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
        Ok(Self {
            redis,
            namespace: namespace.into(),
            channel: channel.into(),
        })
    }

    /// Ask the server to publish the keyspace events the listener relies on.
    ///
    /// Managed Redis offerings often forbid CONFIG; callers treat failure as
    /// non-fatal and fall back to explicit invalidation messages plus TTLs.
    pub async fn enable_keyspace_events(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(KEYSPACE_EVENTS)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(events = KEYSPACE_EVENTS, "enabled Redis keyspace notifications");
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn redis_key(&self, key: &CacheKey) -> String {
        format_key(&self.namespace, key)
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get_fields(&self, key: &CacheKey) -> Result<Option<StoredTile>, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.redis.clone();

        let ((payload, content_type), ttl): ((Option<Vec<u8>>, Option<String>), i64) =
            redis::pipe()
                .cmd("HMGET")
                .arg(&redis_key)
                .arg(PAYLOAD_FIELD)
                .arg(CONTENT_TYPE_FIELD)
                .cmd("TTL")
                .arg(&redis_key)
                .query_async(&mut conn)
                .await?;

        match (payload, content_type) {
            (Some(payload), Some(content_type)) => Ok(Some(StoredTile {
                record: TileRecord {
                    payload: Bytes::from(payload),
                    content_type,
                },
                // -1: no expiry, -2: vanished between the two commands
                ttl_secs: u64::try_from(ttl).ok().filter(|t| *t > 0),
            })),
            (None, None) => Ok(None),
            _ => {
                warn!(
                    key = %key,
                    redis_key = %redis_key,
                    "L2 record is missing a field. Deleting corrupt entry."
                );
                if let Err(e) = conn.del::<_, ()>(&redis_key).await {
                    warn!(key = %key, error = %e, "failed to delete corrupt L2 entry");
                }
                Ok(None)
            }
        }
    }

    async fn set_fields_with_ttl(
        &self,
        key: &CacheKey,
        record: &TileRecord,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.redis.clone();
        let ttl = i64::try_from(ttl_secs.max(1)).unwrap_or(i64::MAX);

        redis::pipe()
            .atomic()
            .hset(&redis_key, PAYLOAD_FIELD, &record.payload[..])
            .ignore()
            .hset(&redis_key, CONTENT_TYPE_FIELD, &record.content_type)
            .ignore()
            .expire(&redis_key, ttl)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(key = %key, ttl_secs, "L2 record written");
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.redis_key(key)).await?;
        Ok(())
    }

    async fn publish_invalidation(&self, keys: &[CacheKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let batch = InvalidationBatch {
            keys: keys.iter().map(|k| self.redis_key(k)).collect(),
        };
        let payload =
            serde_json::to_string(&batch).map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(&self.channel, &payload).await?;
        debug!(
            channel = %self.channel,
            count = batch.keys.len(),
            "published cache invalidation"
        );
        Ok(())
    }
}
