//! Change events exchanged between instances over the bus.
//!
//! An event announces that a key's document moved to a new store version.
//! It carries no payload: receivers invalidate and re-read the store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{InstanceId, Version};

use super::keys::CacheKey;

/// What happened to the document behind a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The document was created or replaced.
    Upsert,
    /// The document was removed.
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Upsert => "upsert",
            ChangeKind::Delete => "delete",
        }
    }
}

/// Change notification published after a committed store write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique identifier, for log correlation across instances.
    pub id: Uuid,
    pub key: CacheKey,
    pub kind: ChangeKind,
    /// Store version the change produced.
    pub version: Version,
    /// Instance that performed the write.
    pub producer: InstanceId,
    #[serde(with = "time::serde::rfc3339")]
    pub produced_at: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(key: CacheKey, kind: ChangeKind, version: Version, producer: InstanceId) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            version,
            producer,
            produced_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn upsert(key: CacheKey, version: Version, producer: InstanceId) -> Self {
        Self::new(key, ChangeKind::Upsert, version, producer)
    }

    pub fn delete(key: CacheKey, version: Version, producer: InstanceId) -> Self {
        Self::new(key, ChangeKind::Delete, version, producer)
    }

    /// Encode the event as a JSON bus record payload.
    pub fn encode(&self) -> Result<Bytes, EventCodecError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| EventCodecError::Encode(err.to_string()))
    }

    /// Decode a bus record payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EventCodecError> {
        serde_json::from_slice(payload).map_err(|err| EventCodecError::Decode(err.to_string()))
    }

    /// Time elapsed between production and `now`, clamped at zero.
    pub fn lag(&self, now: OffsetDateTime) -> std::time::Duration {
        let elapsed = now - self.produced_at;
        elapsed.try_into().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Error)]
pub enum EventCodecError {
    #[error("failed to encode change event: {0}")]
    Encode(String),
    #[error("malformed change event payload: {0}")]
    Decode(String),
}
