//! Bus configuration
//!
//! A node is addressed on the wire by its *node id*, `channel_base#node_name`.
//! Events may target a bare node name, which is expanded against
//! `channel_base`, or `"*"` which expands to the broadcast address
//! `channel_base#*`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{Error, Result};

/// Separator between the channel base and the node name
pub const NODE_SEPARATOR: char = '#';

/// Target value meaning "every node"
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Transport host
    pub host: String,
    /// Transport port
    pub port: u16,
    /// Optional transport password
    pub password: Option<String>,
    /// Shared broadcast channel every node listens on
    pub channel: String,
    /// Prefix of node-addressed channels
    pub channel_base: String,
    /// Name of this node; defaults to a random id
    pub node_name: String,
    /// Default timeout for `Bus::request`, in milliseconds
    pub timeout_ms: u64,
    /// Granularity at which waiters re-check their response slot, in milliseconds
    pub wait_before_iteration_ms: u64,
    /// Delay before re-subscribing after a lost connection, in milliseconds
    pub reconnect_delay_ms: u64,
    /// Emit per-message debug traces
    pub debug: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            channel: "relaybus".to_string(),
            channel_base: "relaybus".to_string(),
            node_name: uuid::Uuid::new_v4().simple().to_string(),
            timeout_ms: 2000,
            wait_before_iteration_ms: 50,
            reconnect_delay_ms: 3000,
            debug: false,
        }
    }
}

impl BusConfig {
    /// Parse a configuration from JSON; absent fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_channel_base(mut self, channel_base: impl Into<String>) -> Self {
        self.channel_base = channel_base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_wait_before_iteration(mut self, wait: Duration) -> Self {
        self.wait_before_iteration_ms = saturating_millis(wait);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check the invariants the bus relies on
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(Error::configuration(
                "channel must not be empty",
                Some("channel".to_string()),
            ));
        }
        if self.channel_base.is_empty() || self.channel_base.contains(NODE_SEPARATOR) {
            return Err(Error::configuration(
                format!("channel_base must be non-empty and must not contain '{NODE_SEPARATOR}'"),
                Some("channel_base".to_string()),
            ));
        }
        if self.node_name.is_empty()
            || self.node_name == BROADCAST
            || self.node_name.contains(NODE_SEPARATOR)
        {
            return Err(Error::configuration(
                format!("node_name must be non-empty, not '{BROADCAST}', and free of '{NODE_SEPARATOR}'"),
                Some("node_name".to_string()),
            ));
        }
        if self.wait_before_iteration_ms == 0 {
            return Err(Error::configuration(
                "wait_before_iteration_ms must be greater than zero",
                Some("wait_before_iteration_ms".to_string()),
            ));
        }
        if self.port == 0 {
            return Err(Error::configuration(
                "port must be non-zero",
                Some("port".to_string()),
            ));
        }
        Ok(())
    }

    /// This node's channel id
    pub fn node_id(&self) -> String {
        format!("{}{NODE_SEPARATOR}{}", self.channel_base, self.node_name)
    }

    /// Address accepted by every node
    pub fn broadcast_address(&self) -> String {
        format!("{}{NODE_SEPARATOR}{BROADCAST}", self.channel_base)
    }

    /// Pattern matching every node-addressed channel
    pub fn wildcard_pattern(&self) -> String {
        self.broadcast_address()
    }

    /// Expand a target to a full channel id; values that already carry a
    /// channel base are kept as they are
    pub fn resolve_target(&self, target: &str) -> String {
        if target.contains(NODE_SEPARATOR) {
            target.to_string()
        } else {
            format!("{}{NODE_SEPARATOR}{target}", self.channel_base)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn wait_before_iteration(&self) -> Duration {
        Duration::from_millis(self.wait_before_iteration_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Connection URL for Redis-compatible servers
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
