//! Message bus ports: publishing change events and consuming raw records.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::{CacheKey, ChangeEvent, EventCodecError};

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Codec(#[from] EventCodecError),
    #[error("subscription closed")]
    Closed,
}

impl BusError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Whether another attempt may succeed. Rejections, codec failures and
    /// closed topics fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A raw record handed out by a subscription.
///
/// The payload is decoded by the consumer so that malformed records can be
/// skipped without stalling the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: usize,
    pub offset: u64,
    pub key: CacheKey,
    pub payload: Bytes,
}

/// Publishes change events, partitioned by key so per-key order is kept.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), BusError>;
}

/// One subscriber group's view of the change topic.
///
/// Delivery is at-least-once: records that were handed out but never
/// acknowledged are delivered again to the next subscription of the group.
#[async_trait]
pub trait EventSubscriber: Send {
    /// Wait up to `wait` for the next record; `None` when nothing arrived.
    async fn poll(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError>;

    /// Commit the record so it is not delivered to this group again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}
