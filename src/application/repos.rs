//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::CacheKey;
use crate::domain::entities::{Document, Version};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Authoritative document store keyed by [`CacheKey`].
///
/// The store assigns versions: every `save` and every `remove` moves the key
/// to a strictly greater [`Version`]. Implementations own no cache state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the current document, `None` when the key has no document.
    async fn load(&self, key: &CacheKey) -> Result<Option<Document>, StoreError>;

    /// Persist `value` and return the version it was committed at.
    async fn save(&self, key: &CacheKey, value: Bytes) -> Result<Version, StoreError>;

    /// Remove the document and return the version the removal consumed.
    async fn remove(&self, key: &CacheKey) -> Result<Version, StoreError>;
}
