use std::time::Duration;

use thiserror::Error;

use crate::application::bus::BusError;
use crate::application::repos::StoreError;
use crate::domain::entities::Version;

use super::keys::CacheKey;

/// Errors surfaced by the coherence engine.
///
/// Cloneable so that every waiter of a shared load receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum CoherenceError {
    #[error("failed to read `{key}` from the store: {source}")]
    StoreRead {
        key: CacheKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to write `{key}` to the store: {source}")]
    StoreWrite {
        key: CacheKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to publish change for `{key}`: {source}")]
    Publish {
        key: CacheKey,
        #[source]
        source: BusError,
    },
    #[error("{op} for `{key}` timed out after {after:?}")]
    Timeout {
        op: &'static str,
        key: CacheKey,
        after: Duration,
    },
    #[error("stale change event for `{key}`: {event_version} is not newer than {known}")]
    StaleEvent {
        key: CacheKey,
        event_version: Version,
        known: Version,
    },
}

impl CoherenceError {
    pub fn timeout(op: &'static str, key: &CacheKey, after: Duration) -> Self {
        Self::Timeout {
            op,
            key: key.clone(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
