//! Coherence engine.
//!
//! Read-through and write-through access to the document store, backed by
//! the local cache, plus the invalidation policy applied to change events.
//!
//! ## Consistency
//!
//! Store commit order is authoritative. Every cached entry and every
//! high-water mark carries the store version it was derived from; the cache
//! never accepts a version older than one it has already seen for the key.
//! A change committed by another instance reaches this one within
//! [`CoherenceEngine::staleness_bound`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::application::repos::{DocumentStore, StoreError};
use crate::domain::entities::{Document, InstanceId, Version};

use super::config::CoherenceConfig;
use super::error::CoherenceError;
use super::events::{ChangeEvent, ChangeKind};
use super::flight::FlightGroup;
use super::keys::CacheKey;
use super::publisher::PublishQueue;
use super::store::{EvictionCause, InsertOutcome, LocalCache, RemovalOutcome};

const METRIC_CACHE_HIT: &str = "template_engine_cache_hit_total";
const METRIC_CACHE_MISS: &str = "template_engine_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "template_engine_cache_evict_total";
const METRIC_STORE_LOAD: &str = "template_engine_cache_store_load_total";
const METRIC_EVENT_APPLIED: &str = "template_engine_cache_event_applied_total";
const METRIC_EVENT_STALE: &str = "template_engine_cache_event_stale_total";

type LoadResult = Result<Option<Document>, CoherenceError>;

/// What a change event did to the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// A `Delete` removed the cached entry.
    Removed,
    /// An `Upsert` invalidated the cached entry; the next read reloads it.
    Invalidated,
    /// Nothing was cached for the key; only its high-water mark moved.
    Untracked,
}

impl EventOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EventOutcome::Removed => "removed",
            EventOutcome::Invalidated => "invalidated",
            EventOutcome::Untracked => "untracked",
        }
    }
}

pub struct CoherenceEngine {
    config: CoherenceConfig,
    instance: InstanceId,
    store: Arc<dyn DocumentStore>,
    cache: Arc<LocalCache>,
    flights: FlightGroup<LoadResult>,
    publisher: PublishQueue,
}

impl CoherenceEngine {
    pub fn new(
        config: CoherenceConfig,
        instance: InstanceId,
        store: Arc<dyn DocumentStore>,
        publisher: PublishQueue,
    ) -> Self {
        let cache = Arc::new(LocalCache::new(&config));
        cache.set_eviction_listener(Arc::new(|_key: &CacheKey, cause: EvictionCause| {
            counter!(METRIC_CACHE_EVICT, "cause" => cause.as_str()).increment(1);
        }));

        Self {
            config,
            instance,
            store,
            cache,
            flights: FlightGroup::new(),
            publisher,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// Direct access to the local cache, for inspection and maintenance.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Maximum time a cached value may lag a change committed by another
    /// instance, assuming the bus meets its delivery budget.
    pub fn staleness_bound(&self) -> Duration {
        self.config.staleness_bound()
    }

    /// Read `key` under the configured store timeout.
    pub async fn get(&self, key: &CacheKey) -> LoadResult {
        self.get_within(key, self.config.store_timeout).await
    }

    /// Read `key`, loading it from the store on a miss.
    ///
    /// Concurrent misses for the same key share one store read, whose
    /// outcome (document, absence or error) every caller receives. Each
    /// caller waits at most its own `wait`; the shared read itself runs under
    /// the larger of `wait` and the configured store timeout and keeps going
    /// when the caller that started it gives up.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn get_within(&self, key: &CacheKey, wait: Duration) -> LoadResult {
        if let Some(entry) = self.cache.get(key) {
            counter!(METRIC_CACHE_HIT).increment(1);
            return Ok(Some(entry.to_document()));
        }
        counter!(METRIC_CACHE_MISS).increment(1);

        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let load_key = key.clone();
        let ceiling = wait.max(self.config.store_timeout);
        let shared = timeout(
            wait,
            self.flights
                .run(key, move || load_and_populate(store, cache, load_key, ceiling)),
        )
        .await
        .map_err(|_| CoherenceError::timeout("get", key, wait))?;

        shared.unwrap_or_else(|| {
            Err(CoherenceError::StoreRead {
                key: key.clone(),
                source: StoreError::unavailable("shared load was aborted"),
            })
        })
    }

    /// Write `value` under the configured store timeout.
    pub async fn put(
        &self,
        key: &CacheKey,
        value: impl Into<Bytes>,
    ) -> Result<Version, CoherenceError> {
        self.put_within(key, value, self.config.store_timeout).await
    }

    /// Write through to the store, update the cache, then announce the change.
    ///
    /// On failure or timeout the cache is left untouched and nothing is
    /// published.
    #[instrument(skip(self, key, value), fields(key = %key))]
    pub async fn put_within(
        &self,
        key: &CacheKey,
        value: impl Into<Bytes>,
        wait: Duration,
    ) -> Result<Version, CoherenceError> {
        let value = value.into();
        let version = timeout(wait, self.store.save(key, value.clone()))
            .await
            .map_err(|_| CoherenceError::timeout("put", key, wait))?
            .map_err(|source| CoherenceError::StoreWrite {
                key: key.clone(),
                source,
            })?;

        if let InsertOutcome::Superseded { known } = self.cache.insert(key, value, version) {
            debug!(%version, %known, "Newer version already cached, keeping it");
        }
        self.publisher
            .enqueue(ChangeEvent::upsert(key.clone(), version, self.instance));

        Ok(version)
    }

    /// Delete under the configured store timeout.
    pub async fn delete(&self, key: &CacheKey) -> Result<Version, CoherenceError> {
        self.delete_within(key, self.config.store_timeout).await
    }

    /// Remove from the store, drop the cached entry, then announce the removal.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn delete_within(
        &self,
        key: &CacheKey,
        wait: Duration,
    ) -> Result<Version, CoherenceError> {
        let version = timeout(wait, self.store.remove(key))
            .await
            .map_err(|_| CoherenceError::timeout("delete", key, wait))?
            .map_err(|source| CoherenceError::StoreWrite {
                key: key.clone(),
                source,
            })?;

        if let RemovalOutcome::Stale { known } = self.cache.remove_at(key, version) {
            debug!(%version, %known, "Newer version already seen, removal skipped");
        }
        self.publisher
            .enqueue(ChangeEvent::delete(key.clone(), version, self.instance));

        Ok(version)
    }

    /// Apply a change event received from the bus.
    ///
    /// Events at or below the newest known version for the key are rejected
    /// with [`CoherenceError::StaleEvent`]; applying an event twice, or out
    /// of order, therefore leaves the cache as in-order application would.
    pub fn on_change_event(&self, event: &ChangeEvent) -> Result<EventOutcome, CoherenceError> {
        let outcome = match self.cache.remove_at(&event.key, event.version) {
            RemovalOutcome::Stale { known } => {
                counter!(METRIC_EVENT_STALE).increment(1);
                debug!(
                    event_id = %event.id,
                    key = %event.key,
                    event_version = %event.version,
                    %known,
                    "Stale change event dropped"
                );
                return Err(CoherenceError::StaleEvent {
                    key: event.key.clone(),
                    event_version: event.version,
                    known,
                });
            }
            RemovalOutcome::Untracked => EventOutcome::Untracked,
            RemovalOutcome::Removed => match event.kind {
                ChangeKind::Delete => EventOutcome::Removed,
                ChangeKind::Upsert => EventOutcome::Invalidated,
            },
        };

        counter!(METRIC_EVENT_APPLIED, "outcome" => outcome.as_str()).increment(1);
        debug!(
            event_id = %event.id,
            key = %event.key,
            kind = event.kind.as_str(),
            version = %event.version,
            producer = %event.producer,
            outcome = outcome.as_str(),
            "Change event applied"
        );
        Ok(outcome)
    }

    /// Evict `key` from this instance only. No event is published.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.invalidate(key)
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}

async fn load_and_populate(
    store: Arc<dyn DocumentStore>,
    cache: Arc<LocalCache>,
    key: CacheKey,
    wait: Duration,
) -> LoadResult {
    counter!(METRIC_STORE_LOAD).increment(1);
    let loaded = timeout(wait, store.load(&key))
        .await
        .map_err(|_| CoherenceError::timeout("load", &key, wait))?
        .map_err(|source| CoherenceError::StoreRead {
            key: key.clone(),
            source,
        })?;

    if let Some(document) = &loaded
        && let InsertOutcome::Superseded { known } =
            cache.insert(&key, document.value.clone(), document.version)
    {
        debug!(
            key = %key,
            loaded = %document.version,
            %known,
            "Loaded document superseded before it was cached"
        );
    }

    Ok(loaded)
}
