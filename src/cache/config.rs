//! Coherence engine configuration.
//!
//! Resolved from the `[cache]`, `[store]`, `[publisher]` and `[consumer]`
//! sections of `template-engine.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::config::Settings;

// 500 entries, expiring ten minutes after write.
const DEFAULT_MAX_ENTRIES: usize = 500;
const DEFAULT_TTL_SECS: u64 = 600;
const DEFAULT_SHARDS: usize = 16;
const DEFAULT_HIGH_WATER_LIMIT: usize = 4096;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_PUBLISH_QUEUE_LEN: usize = 1024;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_DELIVERY_BUDGET_MS: u64 = 2000;
const DEFAULT_APPLY_BUDGET_MS: u64 = 500;

/// Retry policy for background publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 retries forever).
    pub max_retries: usize,
    /// Single attempt timeout (ms).
    pub timeout_ms: u64,
    /// First backoff delay (ms), doubled after each failed attempt.
    pub base_delay_ms: u64,
    /// Upper bound for the backoff delay (ms).
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            timeout_ms: 1000,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl BackoffPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before attempt `attempt + 1`, for `attempt` counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.base_delay()
            .saturating_mul(factor)
            .min(self.max_delay())
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: usize) -> bool {
        self.max_retries == 0 || attempts < self.max_retries
    }
}

/// Coherence engine configuration.
#[derive(Debug, Clone)]
pub struct CoherenceConfig {
    /// Maximum entries held by the local cache.
    pub max_entries: usize,
    /// Time-to-live of an entry after it was written.
    pub ttl: Duration,
    /// Number of lock stripes in the local cache.
    pub shards: usize,
    /// Maximum high-water marks retained per cache.
    pub high_water_limit: usize,
    /// Default timeout applied to store calls.
    pub store_timeout: Duration,
    /// Capacity of the outgoing change-event queue.
    pub publish_queue_len: usize,
    /// Retry policy of the publish worker.
    pub publish_retry: BackoffPolicy,
    /// Maximum deliveries handled by one `consume_batch` call.
    pub consume_batch_limit: usize,
    /// How long the consumer waits on an empty subscription per poll.
    pub poll_interval: Duration,
    /// Expected worst-case bus delivery latency.
    pub delivery_budget: Duration,
    /// Budget for applying a single event once received.
    pub apply_budget: Duration,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            shards: DEFAULT_SHARDS,
            high_water_limit: DEFAULT_HIGH_WATER_LIMIT,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            publish_queue_len: DEFAULT_PUBLISH_QUEUE_LEN,
            publish_retry: BackoffPolicy::default(),
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            delivery_budget: Duration::from_millis(DEFAULT_DELIVERY_BUDGET_MS),
            apply_budget: Duration::from_millis(DEFAULT_APPLY_BUDGET_MS),
        }
    }
}

impl From<&Settings> for CoherenceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_entries: settings.cache.max_entries.get(),
            ttl: settings.cache.ttl,
            shards: settings.cache.shards.get(),
            high_water_limit: settings.cache.high_water_limit.get(),
            store_timeout: settings.store.timeout,
            publish_queue_len: settings.publisher.queue_len.get(),
            publish_retry: settings.publisher.retry,
            consume_batch_limit: settings.consumer.batch_limit.get(),
            poll_interval: settings.consumer.poll_interval,
            delivery_budget: settings.consumer.delivery_budget,
            apply_budget: settings.consumer.apply_budget,
        }
    }
}

impl CoherenceConfig {
    /// Stripe count, clamped to at least 1 and at most `max_entries`.
    pub fn shards_non_zero(&self) -> NonZeroUsize {
        let shards = self.shards.min(self.max_entries.max(1));
        NonZeroUsize::new(shards).unwrap_or(NonZeroUsize::MIN)
    }

    /// Per-stripe entry capacity, clamping to 1 if zero.
    pub fn shard_capacity_non_zero(&self) -> NonZeroUsize {
        let shards = self.shards_non_zero().get();
        NonZeroUsize::new(self.max_entries.div_ceil(shards)).unwrap_or(NonZeroUsize::MIN)
    }

    /// Per-stripe high-water capacity, clamping to 1 if zero.
    pub fn shard_high_water_non_zero(&self) -> NonZeroUsize {
        let shards = self.shards_non_zero().get();
        NonZeroUsize::new(self.high_water_limit.div_ceil(shards)).unwrap_or(NonZeroUsize::MIN)
    }

    /// Maximum time a cached value may lag a committed change made elsewhere.
    ///
    /// A change becomes visible to this instance once the bus has delivered
    /// the event (`delivery_budget`), the consumer has picked it up (at most
    /// one `poll_interval` later) and applied it (`apply_budget`).
    pub fn staleness_bound(&self) -> Duration {
        self.delivery_budget + self.poll_interval + self.apply_budget
    }
}
