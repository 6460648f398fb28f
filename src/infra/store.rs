//! In-memory document store.
//!
//! Assigns per-key revisions the way the production store does: every save
//! and every removal moves the key to the next revision. Revisions survive
//! removal so a re-created document continues from where it left off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::application::repos::{DocumentStore, StoreError};
use crate::cache::CacheKey;
use crate::domain::entities::{Document, Version};

#[derive(Debug, Default)]
struct Slot {
    value: Option<Bytes>,
    revision: u64,
}

#[derive(Default)]
struct Inner {
    slots: DashMap<CacheKey, Slot>,
    loads: AtomicUsize,
    writes: AtomicUsize,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
}

/// Shared handle to an in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Inner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    /// Number of `save` and `remove` calls committed so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Make every call fail with [`StoreError::Unavailable`] until restored.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Read the stored document without counting a load.
    pub fn peek(&self, key: &CacheKey) -> Option<Document> {
        self.inner.slots.get(key).and_then(|slot| {
            slot.value
                .clone()
                .map(|value| Document::new(value, Version::new(slot.revision)))
        })
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store switched off"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, key: &CacheKey) -> Result<Option<Document>, StoreError> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.peek(key))
    }

    async fn save(&self, key: &CacheKey, value: Bytes) -> Result<Version, StoreError> {
        self.enter().await?;
        let mut slot = self.inner.slots.entry(key.clone()).or_default();
        slot.revision += 1;
        slot.value = Some(value);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Version::new(slot.revision))
    }

    async fn remove(&self, key: &CacheKey) -> Result<Version, StoreError> {
        self.enter().await?;
        let mut slot = self.inner.slots.entry(key.clone()).or_default();
        slot.revision += 1;
        slot.value = None;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Version::new(slot.revision))
    }
}
