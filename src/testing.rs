//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};

use crate::config::LocalStoreConfig;
use crate::distributed_store::{DistributedStore, StoredTile, TileRecord};
use crate::error::{FetchError, StoreError};
use crate::invalidation::{InvalidationBatch, InvalidationFeed, InvalidationStream};
use crate::key::CacheKey;
use crate::local_store::LocalStore;
use crate::origin::{OriginGateway, OriginResponse};
use crate::telemetry::FixedMemoryProbe;

/// Local store pinned to the minimum capacity (100 entries).
pub(crate) fn small_local_store() -> LocalStore {
    LocalStore::new(
        LocalStoreConfig {
            memory_fraction: 1.0,
            average_entry_bytes: 1,
            sample_interval: Duration::from_secs(3600),
            sample_every_puts: u64::MAX,
            ..Default::default()
        },
        Arc::new(FixedMemoryProbe(0)),
    )
}

struct StoredValue {
    record: TileRecord,
    ttl_secs: u64,
    expires_at: Instant,
}

/// [`DistributedStore`] over a map, with switchable failures.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<CacheKey, StoredValue>>,
    published: Mutex<Vec<CacheKey>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if a peer instance had written it.
    pub fn insert(&self, key: &CacheKey, payload: &'static [u8], content_type: &str, ttl_secs: u64) {
        self.records.lock().insert(
            key.clone(),
            StoredValue {
                record: TileRecord {
                    payload: bytes::Bytes::from_static(payload),
                    content_type: content_type.to_owned(),
                },
                ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
    }

    /// Record and TTL as last written.
    pub fn written(&self, key: &CacheKey) -> Option<(TileRecord, u64)> {
        self.records
            .lock()
            .get(key)
            .map(|v| (v.record.clone(), v.ttl_secs))
    }

    pub fn published(&self) -> Vec<CacheKey> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get_fields(&self, key: &CacheKey) -> Result<Option<StoredTile>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("read refused".to_owned()));
        }
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| StoredTile {
                record: v.record.clone(),
                ttl_secs: Some(v.expires_at.duration_since(now).as_secs().max(1)),
            }))
    }

    async fn set_fields_with_ttl(
        &self,
        key: &CacheKey,
        record: &TileRecord,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("write refused".to_owned()));
        }
        self.records.lock().insert(
            key.clone(),
            StoredValue {
                record: record.clone(),
                ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.records.lock().remove(key);
        Ok(())
    }

    async fn publish_invalidation(&self, keys: &[CacheKey]) -> Result<(), StoreError> {
        self.published.lock().extend_from_slice(keys);
        Ok(())
    }
}

/// [`OriginGateway`] returning a fixed outcome and counting calls.
///
/// With a gate, each fetch waits for a permit before answering.
pub(crate) struct ScriptedOrigin {
    outcome: Mutex<Result<OriginResponse, FetchError>>,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedOrigin {
    pub fn new(outcome: Result<OriginResponse, FetchError>) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(outcome: Result<OriginResponse, FetchError>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(outcome)
        }
    }

    pub fn set_outcome(&self, outcome: Result<OriginResponse, FetchError>) {
        *self.outcome.lock() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginGateway for ScriptedOrigin {
    async fn fetch(
        &self,
        _path: &str,
        _params: &[(String, String)],
    ) -> Result<OriginResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            permit.forget();
        }
        self.outcome.lock().clone()
    }
}

/// [`InvalidationFeed`] whose connections are scripted in advance.
///
/// Each `subscribe` consumes the next scripted connection; an empty script
/// or a scripted failure yields an error.
#[derive(Default)]
pub(crate) struct ScriptedFeed {
    script: Mutex<VecDeque<Option<mpsc::UnboundedReceiver<InvalidationBatch>>>>,
    subscriptions: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connection(&self) -> mpsc::UnboundedSender<InvalidationBatch> {
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().push_back(Some(rx));
        tx
    }

    pub fn push_failure(&self) {
        self.script.lock().push_back(None);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvalidationFeed for ScriptedFeed {
    async fn subscribe(&self, _prefix: &str) -> Result<InvalidationStream, StoreError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Some(rx)) => Ok(rx.boxed()),
            _ => Err(StoreError::Connection("scripted failure".to_owned())),
        }
    }
}
