//! End-to-end coherence behaviour: engines over a shared store and bus.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use template_engine::application::bus::{EventPublisher, EventSubscriber};
use template_engine::application::repos::DocumentStore;
use template_engine::cache::{
    CacheKey, ChangeEvent, CoherenceEngine, CoherenceError, EventConsumer, EventOutcome,
    publish_channel,
};
use template_engine::domain::entities::{Document, InstanceId, Version};

use support::{Cluster, eventually, fast_config};

fn key(id: &str) -> CacheKey {
    CacheKey::new(id)
}

/// Engine without a publish worker; its change events are discarded.
fn detached_engine(cluster: &Cluster) -> CoherenceEngine {
    let config = fast_config();
    let (queue, _worker) =
        publish_channel(64, Arc::new(cluster.bus.clone()), config.publish_retry);
    CoherenceEngine::new(
        config,
        InstanceId::random(),
        Arc::new(cluster.store.clone()),
        queue,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_then_read_is_served_from_cache() {
    let cluster = Cluster::new();
    let node = cluster.join("a");

    let version = node.engine().put(&key("a"), "x").await.expect("put");
    let doc = node.engine().get(&key("a")).await.expect("get");

    assert_eq!(doc, Some(Document::new("x", version)));
    assert_eq!(cluster.store.load_count(), 0);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_of_absent_key_share_one_store_read() {
    let cluster = Cluster::new();
    cluster.store.set_latency(Duration::from_millis(50));
    let node = cluster.join("a");

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = Arc::clone(node.engine());
        handles.push(tokio::spawn(async move { engine.get(&key("ghost")).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("reader task").expect("get"), None);
    }

    assert_eq!(cluster.store.load_count(), 1);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn applying_the_same_event_twice_is_a_noop() {
    let cluster = Cluster::new();
    let engine = detached_engine(&cluster);
    engine.put(&key("a"), "x").await.expect("put");

    let event = ChangeEvent::upsert(key("a"), Version::new(2), InstanceId::random());
    assert_eq!(
        engine.on_change_event(&event).expect("first delivery"),
        EventOutcome::Invalidated
    );

    // Reload the newer document, then replay the event.
    cluster.store.save(&key("a"), Bytes::from("y")).await.expect("save");
    let reloaded = engine.get(&key("a")).await.expect("get").expect("found");
    assert!(matches!(
        engine.on_change_event(&event),
        Err(CoherenceError::StaleEvent { .. })
    ));
    assert_eq!(
        engine.cache().get(&key("a")).expect("still cached").version,
        reloaded.version
    );
}

#[tokio::test]
async fn out_of_order_events_converge_to_in_order_state() {
    let cluster = Cluster::new();
    let in_order = detached_engine(&cluster);
    let shuffled = detached_engine(&cluster);
    let producer = InstanceId::random();

    let events = [
        ChangeEvent::upsert(key("a"), Version::new(1), producer),
        ChangeEvent::upsert(key("a"), Version::new(2), producer),
        ChangeEvent::delete(key("a"), Version::new(3), producer),
        ChangeEvent::upsert(key("b"), Version::new(1), producer),
    ];

    for event in &events {
        let _ = in_order.on_change_event(event);
    }
    for index in [2, 3, 0, 1] {
        let _ = shuffled.on_change_event(&events[index]);
    }

    for id in ["a", "b"] {
        assert_eq!(
            in_order.cache().known_version(&key(id)),
            shuffled.cache().known_version(&key(id))
        );
        assert_eq!(
            in_order.cache().get(&key(id)).is_some(),
            shuffled.cache().get(&key(id)).is_some()
        );
    }
    assert_eq!(in_order.cache().known_version(&key("a")), Some(Version::new(3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_upsert_invalidates_and_next_read_reloads() {
    let cluster = Cluster::new();
    let local = cluster.join("local");
    let remote = cluster.join("remote");

    let first = local.engine().put(&key("a"), "x").await.expect("put");
    assert!(local.engine().cache().get(&key("a")).is_some());

    let second = remote.engine().put(&key("a"), "y").await.expect("remote put");
    assert_eq!(second, first.next());

    let bound = local.engine().staleness_bound();
    assert!(
        eventually(bound, || local.engine().cache().get(&key("a")).is_none()).await,
        "remote write was not observed within {bound:?}"
    );

    let loads_before = cluster.store.load_count();
    let doc = local.engine().get(&key("a")).await.expect("get").expect("found");
    assert_eq!(doc, Document::new("y", second));
    assert_eq!(cluster.store.load_count(), loads_before + 1);

    local.shutdown().await.expect("shutdown");
    remote.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_removes_entry_everywhere() {
    let cluster = Cluster::new();
    let writer = cluster.join("writer");
    let reader = cluster.join("reader");

    writer.engine().put(&key("a"), "x").await.expect("put");
    assert!(reader.engine().get(&key("a")).await.expect("get").is_some());

    writer.engine().delete(&key("a")).await.expect("delete");

    assert_eq!(writer.engine().get(&key("a")).await.expect("get"), None);
    assert!(cluster.store.peek(&key("a")).is_none());
    let bound = reader.engine().staleness_bound();
    assert!(eventually(bound, || reader.engine().cache().get(&key("a")).is_none()).await);
    assert_eq!(reader.engine().get(&key("a")).await.expect("get"), None);

    writer.shutdown().await.expect("shutdown");
    reader.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn store_write_timeout_leaves_cache_unchanged() {
    let cluster = Cluster::new();
    let engine = detached_engine(&cluster);
    let version = engine.put(&key("a"), "x").await.expect("put");

    cluster.store.set_latency(Duration::from_millis(500));
    let err = engine
        .put_within(&key("a"), "y", Duration::from_millis(20))
        .await
        .expect_err("write times out");
    assert!(err.is_timeout());

    let cached = engine.cache().get(&key("a")).expect("entry kept");
    assert_eq!(cached.value, Bytes::from("x"));
    assert_eq!(cached.version, version);
}

#[tokio::test]
async fn store_read_failure_is_shared_and_not_cached() {
    let cluster = Cluster::new();
    let engine = detached_engine(&cluster);
    cluster.store.save(&key("a"), Bytes::from("x")).await.expect("save");
    cluster.store.set_available(false);

    let err = engine.get(&key("a")).await.expect_err("store down");
    assert!(matches!(err, CoherenceError::StoreRead { .. }));
    assert!(engine.cache().is_empty());

    cluster.store.set_available(true);
    assert!(engine.get(&key("a")).await.expect("get").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_failures_are_retried_until_delivered() {
    let cluster = Cluster::new();
    let writer = cluster.join("writer");
    let reader = cluster.join("reader");

    reader
        .engine()
        .cache()
        .insert(&key("a"), Bytes::from("old"), Version::new(0));
    cluster.bus.fail_next(3);

    writer.engine().put(&key("a"), "new").await.expect("put");

    let within = reader.engine().staleness_bound() + Duration::from_secs(1);
    assert!(eventually(within, || reader.engine().cache().get(&key("a")).is_none()).await);
    assert_eq!(cluster.bus.len(), 1);

    writer.shutdown().await.expect("shutdown");
    reader.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn malformed_records_are_skipped_and_acknowledged() {
    let cluster = Cluster::new();
    let engine = Arc::new(detached_engine(&cluster));
    let subscription = cluster.bus.subscribe("g");

    cluster
        .bus
        .publish_raw(&key("a"), Bytes::from_static(b"\x00garbage"))
        .expect("append");
    cluster
        .bus
        .publish(&ChangeEvent::delete(key("a"), Version::new(4), InstanceId::random()))
        .await
        .expect("publish");

    let mut consumer = EventConsumer::new(Arc::clone(&engine), subscription);
    let report = consumer.consume_batch(10).await.expect("consume");

    assert_eq!(report.malformed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(engine.cache().known_version(&key("a")), Some(Version::new(4)));

    let partition = cluster.bus.partition_for(&key("a"));
    let committed = cluster.bus.committed("g").expect("group exists");
    assert_eq!(committed[partition], 2);
}

#[tokio::test]
async fn unacknowledged_records_are_redelivered() {
    let cluster = Cluster::new();
    let engine = Arc::new(detached_engine(&cluster));
    let mut crashed = cluster.bus.subscribe("g");

    cluster
        .bus
        .publish(&ChangeEvent::upsert(key("a"), Version::new(7), InstanceId::random()))
        .await
        .expect("publish");

    // Received but never acknowledged before the subscriber went away.
    let lost = crashed
        .poll(Duration::ZERO)
        .await
        .expect("poll")
        .expect("delivery");
    drop(crashed);

    let mut consumer = EventConsumer::new(Arc::clone(&engine), cluster.bus.subscribe("g"));
    let report = consumer.consume_batch(10).await.expect("consume");

    assert_eq!(report.applied, 1);
    assert_eq!(engine.cache().known_version(&lost.key), Some(Version::new(7)));

    // A second replay is now a stale no-op.
    let mut again = EventConsumer::new(Arc::clone(&engine), cluster.bus.subscribe("g"));
    assert_eq!(again.consume_batch(10).await.expect("consume").total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instances_converge_within_staleness_bound() {
    let cluster = Cluster::new();
    let first = cluster.join("first");
    let second = cluster.join("second");
    let bound = first.engine().staleness_bound();

    for round in 0..5_u64 {
        let value = format!("value-{round}");
        first.engine().get(&key("shared")).await.expect("warm first");

        let version = second
            .engine()
            .put(&key("shared"), value.clone())
            .await
            .expect("put");

        assert!(
            eventually(bound, || {
                first
                    .engine()
                    .cache()
                    .known_version(&key("shared"))
                    .is_some_and(|known| known >= version)
            })
            .await,
            "round {round}: change not visible within {bound:?}"
        );

        let doc = first.engine().get(&key("shared")).await.expect("get").expect("found");
        assert_eq!(doc.value, Bytes::from(value));
    }

    first.shutdown().await.expect("shutdown");
    second.shutdown().await.expect("shutdown");
}
