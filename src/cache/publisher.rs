//! Background publishing of change events.
//!
//! Writers enqueue events without waiting on the bus. A single worker drains
//! the queue in FIFO order, so events for a key leave this instance in the
//! order their writes committed.

use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::bus::{BusError, EventPublisher};

use super::config::BackoffPolicy;
use super::error::CoherenceError;
use super::events::ChangeEvent;

const METRIC_PUBLISH_QUEUE_LEN: &str = "template_engine_cache_publish_queue_len";
const METRIC_PUBLISH_DROPPED: &str = "template_engine_cache_publish_dropped_total";
const METRIC_PUBLISH_RETRY: &str = "template_engine_cache_publish_retry_total";
const METRIC_PUBLISH_FAILED: &str = "template_engine_cache_publish_failed_total";

/// Create a bounded publish queue and the worker draining it.
pub fn publish_channel(
    capacity: usize,
    publisher: Arc<dyn EventPublisher>,
    policy: BackoffPolicy,
) -> (PublishQueue, PublishWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PublishQueue { tx },
        PublishWorker {
            rx,
            publisher,
            policy,
        },
    )
}

/// Producer side of the publish queue.
#[derive(Clone)]
pub struct PublishQueue {
    tx: mpsc::Sender<ChangeEvent>,
}

impl PublishQueue {
    /// Queue an event without blocking. Returns false if it was dropped.
    pub fn enqueue(&self, event: ChangeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                gauge!(METRIC_PUBLISH_QUEUE_LEN).set(self.pending() as f64);
                true
            }
            Err(TrySendError::Full(event)) => {
                counter!(METRIC_PUBLISH_DROPPED).increment(1);
                error!(
                    event_id = %event.id,
                    key = %event.key,
                    version = %event.version,
                    capacity = self.tx.max_capacity(),
                    "Publish queue full, change event dropped"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                counter!(METRIC_PUBLISH_DROPPED).increment(1);
                error!(
                    event_id = %event.id,
                    key = %event.key,
                    version = %event.version,
                    "Publish worker stopped, change event dropped"
                );
                false
            }
        }
    }

    /// Number of events waiting for the worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Drains the publish queue onto the bus.
pub struct PublishWorker {
    rx: mpsc::Receiver<ChangeEvent>,
    publisher: Arc<dyn EventPublisher>,
    policy: BackoffPolicy,
}

impl PublishWorker {
    /// Publish queued events until `shutdown` fires or every queue handle is
    /// dropped. Events still queued at shutdown get one final attempt each.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(max_retries = self.policy.max_retries, "Publish worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => next,
            };
            let Some(event) = next else {
                break;
            };
            gauge!(METRIC_PUBLISH_QUEUE_LEN).set(self.rx.len() as f64);
            let _ = self.publish_with_retry(&event, &shutdown).await;
        }

        let flushed = self.flush().await;
        info!(flushed, "Publish worker stopped");
    }

    async fn flush(&mut self) -> usize {
        self.rx.close();
        let mut flushed = 0;
        while let Ok(event) = self.rx.try_recv() {
            match self.attempt(&event).await {
                Ok(()) => flushed += 1,
                Err(err) => {
                    counter!(METRIC_PUBLISH_FAILED).increment(1);
                    error!(
                        event_id = %event.id,
                        key = %event.key,
                        error = %err,
                        "Change event lost during shutdown"
                    );
                }
            }
        }
        gauge!(METRIC_PUBLISH_QUEUE_LEN).set(0.0);
        flushed
    }

    async fn attempt(&self, event: &ChangeEvent) -> Result<(), BusError> {
        let after = self.policy.attempt_timeout();
        match timeout(after, self.publisher.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::unavailable(format!(
                "publish timed out after {after:?}"
            ))),
        }
    }

    /// Publish one event, retrying with exponential backoff.
    pub async fn publish_with_retry(
        &self,
        event: &ChangeEvent,
        shutdown: &CancellationToken,
    ) -> Result<(), CoherenceError> {
        let mut attempts = 0_usize;
        loop {
            let err = match self.attempt(event).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.id,
                        key = %event.key,
                        kind = event.kind.as_str(),
                        version = %event.version,
                        attempts = attempts + 1,
                        "Change event published"
                    );
                    return Ok(());
                }
                Err(err) => err,
            };

            attempts += 1;
            if !err.is_retryable() || !self.policy.allows_retry(attempts) {
                counter!(METRIC_PUBLISH_FAILED).increment(1);
                error!(
                    event_id = %event.id,
                    key = %event.key,
                    version = %event.version,
                    attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Giving up on change event"
                );
                return Err(CoherenceError::Publish {
                    key: event.key.clone(),
                    source: err,
                });
            }

            let delay = self
                .policy
                .delay_for(u32::try_from(attempts - 1).unwrap_or(u32::MAX));
            counter!(METRIC_PUBLISH_RETRY).increment(1);
            warn!(
                event_id = %event.id,
                key = %event.key,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Publish failed, retrying"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    counter!(METRIC_PUBLISH_FAILED).increment(1);
                    error!(
                        event_id = %event.id,
                        key = %event.key,
                        attempts,
                        "Shutdown interrupted publish retries"
                    );
                    return Err(CoherenceError::Publish {
                        key: event.key.clone(),
                        source: err,
                    });
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
