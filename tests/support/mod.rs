//! Shared fixtures: engine instances wired to one in-memory store and bus.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use template_engine::cache::{BackoffPolicy, CoherenceConfig};
use template_engine::domain::entities::InstanceId;
use template_engine::infra::bus::MemoryBus;
use template_engine::infra::node::CoherenceNode;
use template_engine::infra::store::MemoryDocumentStore;
use tokio::time::Instant;

pub const TOPIC: &str = "template-cache-changes";

/// Configuration with short budgets so convergence tests stay fast.
pub fn fast_config() -> CoherenceConfig {
    CoherenceConfig {
        poll_interval: Duration::from_millis(50),
        delivery_budget: Duration::from_millis(500),
        apply_budget: Duration::from_millis(100),
        publish_retry: BackoffPolicy {
            max_retries: 10,
            timeout_ms: 200,
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        ..Default::default()
    }
}

/// One authoritative store and one topic shared by every joined instance.
#[derive(Clone)]
pub struct Cluster {
    pub store: MemoryDocumentStore,
    pub bus: MemoryBus,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: MemoryDocumentStore::new(),
            bus: MemoryBus::new(TOPIC, 4),
        }
    }

    /// Start an instance with its own subscriber group.
    pub fn join(&self, group: &str) -> CoherenceNode {
        self.join_with(group, fast_config())
    }

    pub fn join_with(&self, group: &str, config: CoherenceConfig) -> CoherenceNode {
        CoherenceNode::start(
            config,
            InstanceId::random(),
            Arc::new(self.store.clone()),
            Arc::new(self.bus.clone()),
            self.bus.subscribe(group),
            Duration::from_secs(60),
        )
    }
}

/// Poll `check` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
