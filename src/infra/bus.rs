//! In-memory message bus.
//!
//! One topic split into key-hashed partitions, each an append-only log.
//! Subscriber groups track a committed offset per partition; every group sees
//! every record (fan-out), and records handed out but never acknowledged are
//! delivered again to the group's next subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::application::bus::{BusError, Delivery, EventPublisher, EventSubscriber};
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheKey, ChangeEvent};

const SOURCE: &str = "infra::bus";

#[derive(Debug, Clone)]
struct Record {
    key: CacheKey,
    payload: Bytes,
}

struct Inner {
    topic: String,
    partitions: Vec<Mutex<Vec<Record>>>,
    groups: Mutex<HashMap<String, Arc<Mutex<Vec<u64>>>>>,
    appended: Notify,
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

/// Shared handle to an in-memory topic.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new(topic: impl Into<String>, partitions: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                topic: topic.into(),
                partitions,
                groups: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                fail_next: AtomicUsize::new(0),
                unavailable: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }

    /// Partition a key's records land in.
    pub fn partition_for(&self, key: &CacheKey) -> usize {
        key.bucket(self.inner.partitions.len())
    }

    /// Total number of records on the topic.
    pub fn len(&self) -> usize {
        self.inner
            .partitions
            .iter()
            .map(|partition| mutex_lock(partition, SOURCE, "len").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject the next `count` publishes with [`BusError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Reject every publish until restored.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Close the topic; subscriptions report [`BusError::Closed`] once drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    /// Append a raw record, bypassing the event codec.
    pub fn publish_raw(&self, key: &CacheKey, payload: Bytes) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let partition = self.partition_for(key);
        let offset = {
            let mut log = mutex_lock(&self.inner.partitions[partition], SOURCE, "publish");
            log.push(Record {
                key: key.clone(),
                payload,
            });
            log.len() - 1
        };
        debug!(topic = %self.inner.topic, partition, offset, key = %key, "Record appended");
        self.inner.appended.notify_waiters();
        Ok(())
    }

    /// Join `group`, starting from its committed offsets.
    ///
    /// A group seen for the first time starts at the end of every partition.
    pub fn subscribe(&self, group: &str) -> MemorySubscription {
        let committed = {
            let mut groups = mutex_lock(&self.inner.groups, SOURCE, "subscribe");
            let entry = groups.entry(group.to_string()).or_insert_with(|| {
                let ends = self
                    .inner
                    .partitions
                    .iter()
                    .map(|partition| mutex_lock(partition, SOURCE, "subscribe").len() as u64)
                    .collect();
                Arc::new(Mutex::new(ends))
            });
            Arc::clone(entry)
        };
        let cursor = mutex_lock(&committed, SOURCE, "subscribe").clone();

        MemorySubscription {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            committed,
            cursor,
            next_partition: 0,
        }
    }

    /// Committed offsets of `group`, one per partition.
    pub fn committed(&self, group: &str) -> Option<Vec<u64>> {
        let groups = mutex_lock(&self.inner.groups, SOURCE, "committed");
        groups
            .get(group)
            .map(|offsets| mutex_lock(offsets, SOURCE, "committed").clone())
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), BusError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::unavailable("memory bus switched off"));
        }
        let injected = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::unavailable("injected publish failure"));
        }

        let payload = event.encode()?;
        self.publish_raw(&event.key, payload)
    }
}

/// One subscriber group member reading from a [`MemoryBus`].
pub struct MemorySubscription {
    inner: Arc<Inner>,
    group: String,
    committed: Arc<Mutex<Vec<u64>>>,
    cursor: Vec<u64>,
    next_partition: usize,
}

impl MemorySubscription {
    fn try_next(&mut self) -> Option<Delivery> {
        let count = self.inner.partitions.len();
        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let offset = self.cursor[partition];
            let record = {
                let log = mutex_lock(&self.inner.partitions[partition], SOURCE, "poll");
                usize::try_from(offset)
                    .ok()
                    .and_then(|index| log.get(index).cloned())
            };
            if let Some(record) = record {
                self.cursor[partition] = offset + 1;
                self.next_partition = (partition + 1) % count;
                return Some(Delivery {
                    partition,
                    offset,
                    key: record.key,
                    payload: record.payload,
                });
            }
        }
        None
    }
}

#[async_trait]
impl EventSubscriber for MemorySubscription {
    async fn poll(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + wait;
        let inner = Arc::clone(&self.inner);
        loop {
            let appended = inner.appended.notified();
            if let Some(delivery) = self.try_next() {
                return Ok(Some(delivery));
            }
            if inner.closed.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }
            if wait.is_zero() || timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut committed = mutex_lock(&self.committed, SOURCE, "ack");
        let slot = committed.get_mut(delivery.partition).ok_or_else(|| {
            BusError::Rejected(format!("unknown partition {}", delivery.partition))
        })?;
        *slot = (*slot).max(delivery.offset + 1);
        debug!(
            group = %self.group,
            partition = delivery.partition,
            committed = *slot,
            "Delivery acknowledged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{InstanceId, Version};

    fn upsert(key: &str, version: u64) -> ChangeEvent {
        ChangeEvent::upsert(CacheKey::new(key), Version::new(version), InstanceId::random())
    }

    #[tokio::test]
    async fn every_group_sees_every_record() {
        let bus = MemoryBus::new("changes", 4);
        let mut first = bus.subscribe("a");
        let mut second = bus.subscribe("b");

        bus.publish(&upsert("k", 1)).await.expect("publish");

        for subscription in [&mut first, &mut second] {
            let delivery = subscription
                .poll(Duration::ZERO)
                .await
                .expect("poll")
                .expect("delivery");
            let event = ChangeEvent::decode(&delivery.payload).expect("decode");
            assert_eq!(event.version, Version::new(1));
        }
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let bus = MemoryBus::new("changes", 8);
        let mut subscription = bus.subscribe("g");

        for version in 1..=5 {
            bus.publish(&upsert("k", version)).await.expect("publish");
        }

        let mut seen = Vec::new();
        while let Some(delivery) = subscription.poll(Duration::ZERO).await.expect("poll") {
            let event = ChangeEvent::decode(&delivery.payload).expect("decode");
            seen.push(event.version.get());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn unacked_records_are_redelivered_to_next_subscription() {
        let bus = MemoryBus::new("changes", 1);
        let mut subscription = bus.subscribe("g");
        bus.publish(&upsert("k", 1)).await.expect("publish");
        bus.publish(&upsert("k", 2)).await.expect("publish");

        let first = subscription
            .poll(Duration::ZERO)
            .await
            .expect("poll")
            .expect("delivery");
        subscription.ack(&first).await.expect("ack");
        let second = subscription
            .poll(Duration::ZERO)
            .await
            .expect("poll")
            .expect("delivery");
        drop(subscription);

        let mut again = bus.subscribe("g");
        let redelivered = again
            .poll(Duration::ZERO)
            .await
            .expect("poll")
            .expect("redelivery");
        assert_eq!(redelivered.offset, second.offset);
        assert_eq!(bus.committed("g"), Some(vec![1]));
    }

    #[tokio::test]
    async fn new_group_starts_at_log_end() {
        let bus = MemoryBus::new("changes", 2);
        bus.publish(&upsert("k", 1)).await.expect("publish");

        let mut late = bus.subscribe("late");
        assert!(late.poll(Duration::ZERO).await.expect("poll").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_for_records() {
        let bus = MemoryBus::new("changes", 2);
        let mut subscription = bus.subscribe("g");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher.publish(&upsert("k", 1)).await.expect("publish");
        });

        let delivery = subscription
            .poll(Duration::from_secs(1))
            .await
            .expect("poll");
        assert!(delivery.is_some());
        assert!(
            subscription
                .poll(Duration::from_millis(100))
                .await
                .expect("poll")
                .is_none()
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = MemoryBus::new("changes", 1);
        bus.fail_next(2);

        assert!(bus.publish(&upsert("k", 1)).await.is_err());
        assert!(bus.publish(&upsert("k", 1)).await.is_err());
        assert!(bus.publish(&upsert("k", 1)).await.is_ok());
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn closed_bus_ends_subscriptions() {
        let bus = MemoryBus::new("changes", 1);
        let mut subscription = bus.subscribe("g");
        bus.close();

        assert!(matches!(
            subscription.poll(Duration::from_millis(10)).await,
            Err(BusError::Closed)
        ));
    }
}
