use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use template_engine::application::bus::EventPublisher;
use template_engine::cache::{
    BackoffPolicy, CacheKey, ChangeEvent, CoherenceConfig, CoherenceEngine, EventConsumer,
    publish_channel,
};
use template_engine::domain::entities::{InstanceId, Version};
use template_engine::infra::bus::MemoryBus;
use template_engine::infra::store::MemoryDocumentStore;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn coherence_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let bus = MemoryBus::new("changes", 2);
    let store = MemoryDocumentStore::new();
    let config = CoherenceConfig {
        max_entries: 1,
        shards: 1,
        high_water_limit: 16,
        publish_retry: BackoffPolicy {
            max_retries: 2,
            timeout_ms: 100,
            base_delay_ms: 10,
            max_delay_ms: 10,
        },
        ..Default::default()
    };

    // Hit, miss, store load and capacity eviction.
    let (queue, _worker) = publish_channel(1, Arc::new(bus.clone()), config.publish_retry);
    let engine = Arc::new(CoherenceEngine::new(
        config.clone(),
        InstanceId::random(),
        Arc::new(store.clone()),
        queue,
    ));
    engine.put(&CacheKey::new("a"), "x").await.expect("put a");
    engine.get(&CacheKey::new("a")).await.expect("hit");
    engine.get(&CacheKey::new("missing")).await.expect("miss");

    // The second write finds the queue full and is dropped.
    engine.put(&CacheKey::new("b"), "y").await.expect("put b");

    // One retry, then gives up.
    let (_queue, worker) = publish_channel(4, Arc::new(bus.clone()), config.publish_retry);
    bus.fail_next(2);
    let event = ChangeEvent::upsert(CacheKey::new("c"), Version::new(1), InstanceId::random());
    assert!(
        worker
            .publish_with_retry(&event, &CancellationToken::new())
            .await
            .is_err()
    );

    // Applied, stale and malformed events on the consume path.
    let subscription = bus.subscribe("metrics");
    let producer = InstanceId::random();
    let remote = ChangeEvent::upsert(CacheKey::new("b"), Version::new(9), producer);
    bus.publish(&remote).await.expect("publish");
    bus.publish(&remote).await.expect("publish duplicate");
    bus.publish_raw(&CacheKey::new("b"), Bytes::from_static(b"not json"))
        .expect("publish raw");
    let mut consumer = EventConsumer::new(Arc::clone(&engine), subscription);
    let report = consumer.consume_batch(16).await.expect("consume");
    assert_eq!(report.total(), 3);

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "template_engine_cache_hit_total",
        "template_engine_cache_miss_total",
        "template_engine_cache_evict_total",
        "template_engine_cache_store_load_total",
        "template_engine_cache_event_applied_total",
        "template_engine_cache_event_stale_total",
        "template_engine_cache_event_malformed_total",
        "template_engine_cache_publish_queue_len",
        "template_engine_cache_publish_dropped_total",
        "template_engine_cache_publish_retry_total",
        "template_engine_cache_publish_failed_total",
        "template_engine_cache_consume_ms",
        "template_engine_cache_event_lag_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
