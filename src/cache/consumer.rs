//! Event consumer loop.
//!
//! Pulls change events from a bus subscription and applies them to the
//! coherence engine. A delivery is acknowledged only after its decision has
//! been applied, so a crash between the two leads to a redelivery, which the
//! engine treats as a stale no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::application::bus::{BusError, Delivery, EventSubscriber};

use super::engine::CoherenceEngine;
use super::error::CoherenceError;
use super::events::ChangeEvent;

const METRIC_CACHE_CONSUME_MS: &str = "template_engine_cache_consume_ms";
const METRIC_EVENT_LAG_MS: &str = "template_engine_cache_event_lag_ms";
const METRIC_EVENT_MALFORMED: &str = "template_engine_cache_event_malformed_total";

/// Tally of deliveries handled by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Events that changed the cache or its high-water marks.
    pub applied: usize,
    /// Events at or below a known version, dropped.
    pub stale: usize,
    /// Records that could not be decoded, skipped.
    pub malformed: usize,
}

impl ConsumeReport {
    pub fn total(&self) -> usize {
        self.applied + self.stale + self.malformed
    }

    fn record(&mut self, handled: Handled) {
        match handled {
            Handled::Applied => self.applied += 1,
            Handled::Stale => self.stale += 1,
            Handled::Malformed => self.malformed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Handled {
    Applied,
    Stale,
    Malformed,
}

/// Feeds one subscription into the coherence engine.
pub struct EventConsumer<S> {
    engine: Arc<CoherenceEngine>,
    subscriber: S,
}

impl<S: EventSubscriber> EventConsumer<S> {
    pub fn new(engine: Arc<CoherenceEngine>, subscriber: S) -> Self {
        Self { engine, subscriber }
    }

    /// Handle up to `limit` deliveries that are already available.
    ///
    /// Returns as soon as the subscription has nothing pending.
    #[instrument(skip(self))]
    pub async fn consume_batch(&mut self, limit: usize) -> Result<ConsumeReport, BusError> {
        let mut report = ConsumeReport::default();
        while report.total() < limit {
            let Some(delivery) = self.subscriber.poll(Duration::ZERO).await? else {
                break;
            };
            let handled = self.handle(&delivery).await?;
            report.record(handled);
        }

        if report.total() > 0 {
            debug!(
                applied = report.applied,
                stale = report.stale,
                malformed = report.malformed,
                "Change event batch consumed"
            );
        }
        Ok(report)
    }

    /// Consume until `shutdown` fires or the subscription closes.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConsumeReport {
        let poll_interval = self.engine.config().poll_interval;
        let batch_limit = self.engine.config().consume_batch_limit.max(1);
        let mut report = ConsumeReport::default();
        info!(
            instance = %self.engine.instance(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            staleness_bound_ms = self.engine.staleness_bound().as_millis() as u64,
            "Event consumer started"
        );

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.subscriber.poll(poll_interval) => polled,
            };

            let result = match polled {
                Ok(Some(delivery)) => self.handle_burst(&delivery, batch_limit, &mut report).await,
                Ok(None) => continue,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {}
                Err(BusError::Closed) => {
                    info!("Subscription closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "Event consumer bus error, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        info!(
            applied = report.applied,
            stale = report.stale,
            malformed = report.malformed,
            "Event consumer stopped"
        );
        report
    }

    /// Handle `first`, then whatever is already pending, `limit` deliveries at most.
    /// Each handled delivery lands in `report` before the next one is polled.
    async fn handle_burst(
        &mut self,
        first: &Delivery,
        limit: usize,
        report: &mut ConsumeReport,
    ) -> Result<(), BusError> {
        report.record(self.handle(first).await?);
        for _ in 1..limit {
            let Some(delivery) = self.subscriber.poll(Duration::ZERO).await? else {
                break;
            };
            report.record(self.handle(&delivery).await?);
        }
        Ok(())
    }

    async fn handle(&mut self, delivery: &Delivery) -> Result<Handled, BusError> {
        let started_at = Instant::now();
        let handled = match ChangeEvent::decode(&delivery.payload) {
            Ok(event) => self.apply(&event),
            Err(err) => {
                counter!(METRIC_EVENT_MALFORMED).increment(1);
                warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    key = %delivery.key,
                    error = %err,
                    "Skipping malformed change event"
                );
                Handled::Malformed
            }
        };

        self.subscriber.ack(delivery).await?;

        let elapsed = started_at.elapsed();
        histogram!(METRIC_CACHE_CONSUME_MS).record(elapsed.as_secs_f64() * 1000.0);
        let apply_budget = self.engine.config().apply_budget;
        if elapsed > apply_budget {
            warn!(
                offset = delivery.offset,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = apply_budget.as_millis() as u64,
                "Change event exceeded apply budget"
            );
        }
        Ok(handled)
    }

    fn apply(&self, event: &ChangeEvent) -> Handled {
        let lag = event.lag(OffsetDateTime::now_utc());
        histogram!(METRIC_EVENT_LAG_MS).record(lag.as_secs_f64() * 1000.0);
        let bound = self.engine.staleness_bound();
        if lag > bound {
            warn!(
                event_id = %event.id,
                key = %event.key,
                lag_ms = lag.as_millis() as u64,
                bound_ms = bound.as_millis() as u64,
                "Change event arrived beyond staleness bound"
            );
        }

        match self.engine.on_change_event(event) {
            Ok(_) => Handled::Applied,
            Err(CoherenceError::StaleEvent { .. }) => Handled::Stale,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Change event not applied");
                Handled::Stale
            }
        }
    }
}
