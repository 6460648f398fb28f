//! Runtime wiring for one engine instance.
//!
//! Spawns the publish worker, the event consumer and the expired-entry
//! sweeper next to a shared [`CoherenceEngine`], and stops them together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::bus::{EventPublisher, EventSubscriber};
use crate::application::repos::DocumentStore;
use crate::cache::{
    CoherenceConfig, CoherenceEngine, ConsumeReport, EventConsumer, publish_channel,
};
use crate::domain::entities::InstanceId;

use super::error::InfraError;

pub struct CoherenceNode {
    engine: Arc<CoherenceEngine>,
    shutdown: CancellationToken,
    publisher: JoinHandle<()>,
    consumer: JoinHandle<ConsumeReport>,
    sweeper: JoinHandle<()>,
}

impl CoherenceNode {
    /// Build the engine and spawn its background tasks.
    ///
    /// `subscriber` should be created before the first write so this
    /// instance observes every change made after it started.
    pub fn start<S>(
        config: CoherenceConfig,
        instance: InstanceId,
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn EventPublisher>,
        subscriber: S,
        purge_interval: Duration,
    ) -> Self
    where
        S: EventSubscriber + 'static,
    {
        let shutdown = CancellationToken::new();
        let (queue, worker) =
            publish_channel(config.publish_queue_len, publisher, config.publish_retry);
        let engine = Arc::new(CoherenceEngine::new(config, instance, store, queue));

        let publisher = tokio::spawn(worker.run(shutdown.child_token()));
        let consumer = tokio::spawn(
            EventConsumer::new(Arc::clone(&engine), subscriber).run(shutdown.child_token()),
        );
        let sweeper = tokio::spawn(sweep_expired(
            Arc::clone(&engine),
            purge_interval,
            shutdown.child_token(),
        ));

        info!(
            %instance,
            staleness_bound_ms = engine.staleness_bound().as_millis() as u64,
            "Coherence node started"
        );

        Self {
            engine,
            shutdown,
            publisher,
            consumer,
            sweeper,
        }
    }

    pub fn engine(&self) -> &Arc<CoherenceEngine> {
        &self.engine
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(self) -> Result<ConsumeReport, InfraError> {
        self.shutdown.cancel();

        let report = self
            .consumer
            .await
            .map_err(|err| InfraError::task(format!("event consumer: {err}")))?;
        self.publisher
            .await
            .map_err(|err| InfraError::task(format!("publish worker: {err}")))?;
        self.sweeper
            .await
            .map_err(|err| InfraError::task(format!("cache sweeper: {err}")))?;

        info!(instance = %self.engine.instance(), "Coherence node stopped");
        Ok(report)
    }
}

async fn sweep_expired(
    engine: Arc<CoherenceEngine>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip the first immediate tick
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let purged = engine.purge_expired();
                if purged > 0 {
                    debug!(
                        purged,
                        remaining = engine.cache().len(),
                        "Expired cache entries purged"
                    );
                }
            }
        }
    }
}
