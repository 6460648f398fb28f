//! Cache coherence core.
//!
//! Keeps an in-process cache consistent with the authoritative document
//! store:
//!
//! - **Local cache**: bounded, lock-striped LRU map with expire-after-write TTL
//! - **Coherence engine**: read-through and write-through access, single-flight
//!   loads, version-checked invalidation
//! - **Publisher**: ordered background publishing of change events with retry
//! - **Consumer**: standing subscriber applying change events from other instances
//!
//! ## Configuration
//!
//! Behaviour is controlled via `template-engine.toml`:
//!
//! ```toml
//! [cache]
//! max_entries = 500
//! ttl_seconds = 600
//!
//! [store]
//! timeout_ms = 2000
//!
//! [publisher]
//! queue_len = 1024
//! max_retries = 8
//!
//! [consumer]
//! poll_interval_ms = 200
//! delivery_budget_ms = 2000
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod engine;
mod error;
mod events;
mod flight;
mod keys;
pub(crate) mod lock;
mod publisher;
mod store;

pub use config::{BackoffPolicy, CoherenceConfig};
pub use consumer::{ConsumeReport, EventConsumer};
pub use engine::{CoherenceEngine, EventOutcome};
pub use error::CoherenceError;
pub use events::{ChangeEvent, ChangeKind, EventCodecError};
pub use flight::FlightGroup;
pub use keys::{CacheKey, hash_value};
pub use publisher::{PublishQueue, PublishWorker, publish_channel};
pub use store::{
    CacheEntry, EvictionCause, EvictionListener, InsertOutcome, LocalCache, RemovalOutcome,
};
