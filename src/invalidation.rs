//! Cross-instance L1 invalidation.
//!
//! ## How It Works
//!
//! ```text
//! Instance 1: DEL tile:8/1/2/256/png           (or publish on tile:invalidate)
//!   ↓
//! Redis: __keyspace@0__:tile:8/1/2/256/png -> "del"
//!   ↓
//! Instance 2: listener evicts 8/1/2/256/png from L1
//! Instance 3: listener evicts 8/1/2/256/png from L1
//! ```
//!
//! The listener only ever touches L1. While it is disconnected, L1 keeps
//! serving entries that may have been invalidated elsewhere; every entry's own
//! TTL bounds that staleness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::StoreError;
use crate::key::CacheKey;
use crate::local_store::LocalStore;
use crate::metrics::CacheMetrics;

/// Keyspace events that mean a key is gone. Writes (`hset`, `expire`) are
/// ignored so an instance's own write-through never evicts what it just cached.
const REMOVAL_EVENTS: &[&str] = &["del", "unlink", "expired", "evicted"];

/// Set of namespaced keys that are no longer valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationBatch {
    pub keys: Vec<String>,
}

pub type InvalidationStream = BoxStream<'static, InvalidationBatch>;

/// Change feed scoped to a key namespace.
#[async_trait]
pub trait InvalidationFeed: Send + Sync + 'static {
    /// Subscribe to invalidations for keys starting with `prefix`.
    ///
    /// The stream ends when the underlying connection drops.
    async fn subscribe(&self, prefix: &str) -> Result<InvalidationStream, StoreError>;
}

/// Redis pub/sub feed combining keyspace notifications with an explicit
/// invalidation channel.
pub struct RedisInvalidationFeed {
    redis_client: redis::Client,
    channel: String,
}

impl RedisInvalidationFeed {
    pub fn new(redis_client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            redis_client,
            channel: channel.into(),
        }
    }

    fn keyspace_prefix(&self) -> String {
        format!(
            "__keyspace@{}__:",
            self.redis_client.get_connection_info().redis.db
        )
    }
}

#[async_trait]
impl InvalidationFeed for RedisInvalidationFeed {
    async fn subscribe(&self, prefix: &str) -> Result<InvalidationStream, StoreError> {
        let keyspace_prefix = self.keyspace_prefix();
        let pattern = format!("{}{}*", keyspace_prefix, prefix);

        let mut pubsub = self.redis_client.get_async_pubsub().await?;
        pubsub.psubscribe(&pattern).await?;
        pubsub.subscribe(&self.channel).await?;
        info!(pattern = %pattern, channel = %self.channel, "subscribed to invalidations");

        let channel = self.channel.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let batch = match msg.get_payload::<String>() {
                Ok(payload) => {
                    decode_message(msg.get_channel_name(), &payload, &channel, &keyspace_prefix)
                }
                Err(e) => {
                    warn!(error = %e, "failed to decode pub/sub payload");
                    None
                }
            };
            futures::future::ready(batch)
        });

        Ok(stream.boxed())
    }
}

/// Turn one pub/sub message into a batch, if it announces a removal.
///
/// Explicit channel payloads are JSON batches; a bare string is accepted as a
/// single key.
pub fn decode_message(
    channel_name: &str,
    payload: &str,
    explicit_channel: &str,
    keyspace_prefix: &str,
) -> Option<InvalidationBatch> {
    if channel_name == explicit_channel {
        return match serde_json::from_str::<InvalidationBatch>(payload) {
            Ok(batch) => Some(batch),
            Err(_) if !payload.trim().is_empty() => Some(InvalidationBatch {
                keys: vec![payload.trim().to_owned()],
            }),
            Err(_) => None,
        };
    }

    let key = channel_name.strip_prefix(keyspace_prefix)?;
    REMOVAL_EVENTS
        .contains(&payload)
        .then(|| InvalidationBatch {
            keys: vec![key.to_owned()],
        })
}

/// Supervised task applying invalidation batches to the local store.
pub struct InvalidationListener<F: InvalidationFeed> {
    feed: Arc<F>,
    local: Arc<LocalStore>,
    metrics: Arc<CacheMetrics>,
    prefix: String,
    config: ListenerConfig,
}

impl<F: InvalidationFeed> InvalidationListener<F> {
    pub fn new(
        feed: Arc<F>,
        local: Arc<LocalStore>,
        metrics: Arc<CacheMetrics>,
        prefix: impl Into<String>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            feed,
            local,
            metrics,
            prefix: prefix.into(),
            config,
        }
    }

    /// Start listening until `shutdown` is cancelled.
    ///
    /// Reconnects with exponential backoff and jitter whenever the feed ends
    /// or a subscription attempt fails.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut backoff = self.config.initial_backoff;

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.feed.subscribe(&self.prefix) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    backoff = self.config.initial_backoff;
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(batch) => {
                                self.apply(&batch);
                            }
                            None => break,
                        }
                    }
                    warn!(
                        prefix = %self.prefix,
                        "invalidation feed closed; serving L1 on TTL alone until reconnected"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "invalidation subscribe failed, reconnecting..."
                    );
                }
            }

            let delay = with_jitter(backoff, self.config.jitter);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        debug!(prefix = %self.prefix, "invalidation listener stopped");
    }

    /// Evict the batch's keys that belong to this namespace.
    fn apply(&self, batch: &InvalidationBatch) -> usize {
        let keys: Vec<CacheKey> = batch
            .keys
            .iter()
            .filter_map(|k| k.strip_prefix(self.prefix.as_str()))
            .map(CacheKey::from_normalized)
            .collect();

        let removed = self.local.evict(&keys);
        self.metrics.keys_invalidated(removed as u64);
        debug!(
            received = batch.keys.len(),
            removed, "applied invalidation batch"
        );
        removed
    }
}

fn with_jitter(backoff: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return backoff;
    }
    let factor = rand::thread_rng().gen_range(0.0..=jitter);
    backoff + backoff.mul_f64(factor)
}
