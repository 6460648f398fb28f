//! Cache key definitions.
//!
//! `CacheKey` is shared by the document store, the local cache and the bus,
//! where it doubles as the partition key.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Opaque identifier of a cached entity, derived from its store identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable hash used for lock striping and bus partitioning.
    pub fn stable_hash(&self) -> u64 {
        hash_value(&self.0)
    }

    /// Index of the bucket this key falls into out of `buckets`.
    pub fn bucket(&self, buckets: usize) -> usize {
        if buckets <= 1 {
            return 0;
        }
        (self.stable_hash() % buckets as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Compute a hash for any hashable value.
///
/// `DefaultHasher::new()` is seeded with fixed keys, so the result is stable
/// across processes built by the same toolchain.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
