use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tilecache::{
    CacheConfig, CacheKey, CacheStatus, CancellationToken, DistributedStore, FetchError,
    InvalidationFeed, OriginGateway, OriginResponse, RedisInvalidationFeed, RedisStore,
    TileCache, TileRecord, TileRequest, async_trait, format_key,
};

/// Redis URL for the live tests, or `None` to skip them.
fn redis_client() -> Option<redis::Client> {
    let Ok(url) = std::env::var("TILECACHE_REDIS_URL") else {
        eprintln!("skipping Redis test (set TILECACHE_REDIS_URL to run)");
        return None;
    };
    Some(redis::Client::open(url).expect("valid Redis URL"))
}

fn namespace(test: &str) -> String {
    format!("tilecache-test:{}:{}:", std::process::id(), test)
}

fn record(payload: &'static [u8]) -> TileRecord {
    TileRecord {
        payload: Bytes::from_static(payload),
        content_type: "image/png".to_owned(),
    }
}

struct StaticOrigin;

#[async_trait]
impl OriginGateway for StaticOrigin {
    async fn fetch(
        &self,
        _path: &str,
        _params: &[(String, String)],
    ) -> Result<OriginResponse, FetchError> {
        Ok(OriginResponse::new(200, Bytes::from_static(b"origin-tile"))
            .with_header("Cache-Control", "max-age=120")
            .with_header("Content-Type", "image/png"))
    }
}

#[tokio::test]
async fn record_round_trip_keeps_ttl_and_fields() {
    let Some(client) = redis_client() else {
        return;
    };
    let ns = namespace("round-trip");
    let store = RedisStore::connect(&client, ns.clone(), format!("{}invalidate", ns))
        .await
        .expect("connect");
    let key = CacheKey::from_normalized("8/134/86/256/png?style=explore.day");

    store
        .set_fields_with_ttl(&key, &record(b"\x89PNG-bytes"), 60)
        .await
        .expect("write");

    let stored = store.get_fields(&key).await.expect("read").expect("present");
    assert_eq!(stored.record, record(b"\x89PNG-bytes"));
    let ttl = stored.ttl_secs.expect("ttl set");
    assert!((1..=60).contains(&ttl));

    store.delete(&key).await.expect("delete");
    assert!(store.get_fields(&key).await.expect("read").is_none());
}

#[tokio::test]
async fn half_written_record_is_discarded() {
    let Some(client) = redis_client() else {
        return;
    };
    let ns = namespace("half-written");
    let store = RedisStore::connect(&client, ns.clone(), format!("{}invalidate", ns))
        .await
        .expect("connect");
    let key = CacheKey::from_normalized("1/2/3");

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("connection");
    redis::cmd("HSET")
        .arg(format_key(&ns, &key))
        .arg("b")
        .arg("orphan")
        .query_async::<()>(&mut conn)
        .await
        .expect("hset");

    assert!(store.get_fields(&key).await.expect("read").is_none());
    let exists: bool = redis::cmd("EXISTS")
        .arg(format_key(&ns, &key))
        .query_async(&mut conn)
        .await
        .expect("exists");
    assert!(!exists);
}

#[tokio::test]
async fn published_invalidation_reaches_feed() {
    let Some(client) = redis_client() else {
        return;
    };
    let ns = namespace("publish");
    let channel = format!("{}invalidate", ns);
    let store = RedisStore::connect(&client, ns.clone(), channel.clone())
        .await
        .expect("connect");
    let feed = RedisInvalidationFeed::new(client.clone(), channel);
    let mut stream = feed.subscribe(&ns).await.expect("subscribe");

    let key = CacheKey::from_normalized("8/1/2/256/png");
    store
        .publish_invalidation(std::slice::from_ref(&key))
        .await
        .expect("publish");

    let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("batch in time")
        .expect("stream open");
    assert_eq!(batch.keys, vec![format_key(&ns, &key)]);
}

#[tokio::test]
async fn peer_instances_share_l2_and_invalidations() {
    let Some(client) = redis_client() else {
        return;
    };
    let config = CacheConfig {
        namespace: namespace("peers"),
        ..Default::default()
    };
    let shutdown = CancellationToken::new();
    let a = TileCache::connect(client.clone(), config.clone(), StaticOrigin, shutdown.clone())
        .await
        .expect("instance a");
    let b = TileCache::connect(client, config, StaticOrigin, shutdown.clone())
        .await
        .expect("instance b");

    let request = TileRequest::new("mc/8/134/86/256/png").with_query("style=explore.day&apiKey=k");
    let key = a.key_for(&request);

    assert_eq!(a.resolve(&request).await.status, CacheStatus::Miss);
    let remote = b.resolve(&request).await;
    assert_eq!(remote.status, CacheStatus::RemoteHit);
    assert_eq!(remote.payload, Bytes::from_static(b"origin-tile"));
    assert_eq!(b.resolve(&request).await.status, CacheStatus::LocalHit);

    // b's listener subscribes in the background; retry until it has seen one
    let mut evicted = false;
    for _ in 0..50 {
        a.invalidate(&key).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if b.local_store().get(&key).is_none() {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "peer L1 was not invalidated");

    shutdown.cancel();
}
