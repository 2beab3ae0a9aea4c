//! Test utilities shared by the integration tests
//!
//! A `TestCluster` starts any number of nodes on one in-memory broker with
//! short timeouts, so failure paths run in milliseconds.

#![allow(dead_code)]

use relaybus::{Bus, BusConfig, DiscoveredHandler, MemoryBroker, Result};
use std::time::Duration;

pub const CHANNEL: &str = "cluster";

/// Install a tracing subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_config(node: &str) -> BusConfig {
    BusConfig::default()
        .with_channel(CHANNEL)
        .with_channel_base(CHANNEL)
        .with_node_name(node)
        .with_timeout(Duration::from_millis(300))
        .with_wait_before_iteration(Duration::from_millis(10))
        .with_reconnect_delay(Duration::from_millis(30))
        .with_debug(true)
}

pub struct TestCluster {
    pub broker: MemoryBroker,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            broker: MemoryBroker::recording(),
        }
    }

    /// Start a node that understands the given event types and handlers
    pub async fn node(
        &self,
        name: &str,
        configure: impl FnOnce(relaybus::BusBuilder) -> relaybus::BusBuilder,
        handlers: Vec<DiscoveredHandler>,
    ) -> Result<Bus> {
        let builder = Bus::builder(fast_config(name))
            .with_transport(self.broker.transport())
            .with_handlers(handlers);
        let bus = configure(builder).build().await?;
        if !bus.wait_until_subscribed(Duration::from_secs(2)).await {
            return Err(relaybus::Error::subscribe_msg(format!(
                "node {name} never subscribed"
            )));
        }
        Ok(bus)
    }
}

/// Poll `condition` for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
