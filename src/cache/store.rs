//! Local cache storage.
//!
//! A bounded, lock-striped LRU map with expire-after-write TTL. Each stripe
//! also keeps a bounded set of per-key high-water marks: the newest version
//! seen for a key, retained after the entry itself is gone, so a load that
//! raced with an invalidation cannot re-insert an older document.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;

use crate::domain::entities::{Document, Version};

use super::config::CoherenceConfig;
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// A cached document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub version: Version,
    pub inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }

    pub fn to_document(&self) -> Document {
        Document {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionCause {
    /// Least recently used entry dropped to respect the size bound.
    Capacity,
    /// Entry outlived its TTL.
    Expired,
    /// Entry removed by an explicit invalidation or change event.
    Invalidated,
}

impl EvictionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionCause::Capacity => "capacity",
            EvictionCause::Expired => "expired",
            EvictionCause::Invalidated => "invalidated",
        }
    }
}

/// Callback fired after an entry left the cache.
pub type EvictionListener = Arc<dyn Fn(&CacheKey, EvictionCause) + Send + Sync>;

/// Result of a versioned insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Applied,
    /// A newer version is already known; nothing was written.
    Superseded { known: Version },
}

/// Result of applying a versioned removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// An entry was present and has been removed.
    Removed,
    /// No entry was cached; only the high-water mark moved.
    Untracked,
    /// The version is not newer than what the cache already knows.
    Stale { known: Version },
}

struct Shard {
    entries: LruCache<CacheKey, CacheEntry>,
    high_water: LruCache<CacheKey, Version>,
}

impl Shard {
    fn known_version(&self, key: &CacheKey) -> Option<Version> {
        let entry = self.entries.peek(key).map(|entry| entry.version);
        let mark = self.high_water.peek(key).copied();
        entry.max(mark)
    }

    fn raise_high_water(&mut self, key: &CacheKey, version: Version) {
        match self.high_water.get_mut(key) {
            Some(mark) if *mark >= version => {}
            Some(mark) => *mark = version,
            None => {
                self.high_water.put(key.clone(), version);
            }
        }
    }
}

/// Bounded in-process key/value cache with LRU and TTL eviction.
pub struct LocalCache {
    shards: Vec<Mutex<Shard>>,
    ttl: Duration,
    listener: OnceLock<EvictionListener>,
}

impl LocalCache {
    /// Create a new local cache with the given configuration.
    pub fn new(config: &CoherenceConfig) -> Self {
        let shard_count = config.shards_non_zero().get();
        let capacity = config.shard_capacity_non_zero();
        let high_water = config.shard_high_water_non_zero();
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::new(capacity),
                    high_water: LruCache::new(high_water),
                })
            })
            .collect();

        Self {
            shards,
            ttl: config.ttl,
            listener: OnceLock::new(),
        }
    }

    /// Install the eviction listener. Returns false if one was already set.
    pub fn set_eviction_listener(&self, listener: EvictionListener) -> bool {
        self.listener.set(listener).is_ok()
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<Shard> {
        &self.shards[key.bucket(self.shards.len())]
    }

    fn notify(&self, evicted: &[(CacheKey, EvictionCause)]) {
        if let Some(listener) = self.listener.get() {
            for (key, cause) in evicted {
                listener(key, *cause);
            }
        }
    }

    /// Look up a live entry, promoting it in LRU order.
    ///
    /// An expired entry is removed on the way and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let expired = {
            let mut shard = mutex_lock(self.shard(key), SOURCE, "get");
            match shard.entries.get(key) {
                Some(entry) if !entry.is_expired(self.ttl, now) => return Some(entry.clone()),
                Some(_) => {
                    shard.entries.pop(key);
                    true
                }
                None => false,
            }
        };

        if expired {
            self.notify(&[(key.clone(), EvictionCause::Expired)]);
        }
        None
    }

    /// Newest version known for `key`, from the live entry or its high-water mark.
    pub fn known_version(&self, key: &CacheKey) -> Option<Version> {
        mutex_lock(self.shard(key), SOURCE, "known_version").known_version(key)
    }

    /// Insert `value` at `version` unless a newer version is already known.
    pub fn insert(&self, key: &CacheKey, value: Bytes, version: Version) -> InsertOutcome {
        let evicted = {
            let mut shard = mutex_lock(self.shard(key), SOURCE, "insert");
            if let Some(known) = shard.known_version(key)
                && known > version
            {
                return InsertOutcome::Superseded { known };
            }

            shard.raise_high_water(key, version);
            let entry = CacheEntry {
                value,
                version,
                inserted_at: Instant::now(),
            };
            shard
                .entries
                .push(key.clone(), entry)
                .filter(|(evicted_key, _)| evicted_key != key)
                .map(|(evicted_key, _)| evicted_key)
        };

        if let Some(evicted_key) = evicted {
            self.notify(&[(evicted_key, EvictionCause::Capacity)]);
        }
        InsertOutcome::Applied
    }

    /// Drop the entry for `key` because the document moved to `version`.
    ///
    /// Versions at or below the known version are rejected as stale, which
    /// makes repeated and reordered removals idempotent.
    pub fn remove_at(&self, key: &CacheKey, version: Version) -> RemovalOutcome {
        let outcome = {
            let mut shard = mutex_lock(self.shard(key), SOURCE, "remove_at");
            if let Some(known) = shard.known_version(key)
                && known >= version
            {
                return RemovalOutcome::Stale { known };
            }

            shard.raise_high_water(key, version);
            match shard.entries.pop(key) {
                Some(_) => RemovalOutcome::Removed,
                None => RemovalOutcome::Untracked,
            }
        };

        if outcome == RemovalOutcome::Removed {
            self.notify(&[(key.clone(), EvictionCause::Invalidated)]);
        }
        outcome
    }

    /// Remove the entry for `key` regardless of version.
    ///
    /// The high-water mark is kept. Returns true if an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = mutex_lock(self.shard(key), SOURCE, "invalidate")
            .entries
            .pop(key)
            .is_some();
        if removed {
            self.notify(&[(key.clone(), EvictionCause::Invalidated)]);
        }
        removed
    }

    /// Remove every expired entry. Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for shard in &self.shards {
            let mut shard = mutex_lock(shard, SOURCE, "purge_expired");
            let expired: Vec<CacheKey> = shard
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(self.ttl, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                shard.entries.pop(&key);
                evicted.push((key, EvictionCause::Expired));
            }
        }

        self.notify(&evicted);
        evicted.len()
    }

    /// Get the number of cached entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| mutex_lock(shard, SOURCE, "len").entries.len())
            .sum()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries and high-water marks.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = mutex_lock(shard, SOURCE, "clear");
            shard.entries.clear();
            shard.high_water.clear();
        }
    }
}
