//! Event model shared by every node on the bus
//!
//! An event is a plain serde struct that embeds an [`EventHeader`] with
//! `#[serde(flatten)]`, so header fields and event fields share one JSON
//! object on the wire:
//!
//! ```json
//! {"className":"OrderPlaced","id":7,"originator":"shop#web","redisTarget":"shop#billing","order":42}
//! ```
//!
//! Events form a shallow hierarchy by embedding a base event instead of a
//! header (`#[event(extends)]` with the derive macro). A handler declared
//! for the base type also receives every event that extends it.

use std::any::{Any, TypeId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{BROADCAST, NODE_SEPARATOR};
use crate::{codec, Result};

/// Routing and correlation fields carried by every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Tag resolving the concrete event type on decode
    #[serde(rename = "className", default)]
    pub type_tag: String,

    /// Correlation id assigned by the sending node; 0 when never sent
    #[serde(rename = "id", default)]
    pub correlation_id: u64,

    /// Channel id of the sending node
    #[serde(default)]
    pub originator: String,

    /// Destination channel id, a bare node name, or `*`
    #[serde(rename = "redisTarget", default)]
    pub target: String,
}

impl EventHeader {
    /// Header addressed to `target`, either a node name or a full channel id
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            type_tag: String::new(),
            correlation_id: 0,
            originator: String::new(),
            target: target.into(),
        }
    }

    /// Header addressed to every node
    pub fn broadcast() -> Self {
        Self::new(BROADCAST)
    }

    /// Node name part of the target
    pub fn target_node(&self) -> &str {
        node_part(&self.target)
    }

    /// Node name part of the originator
    pub fn originator_node(&self) -> &str {
        node_part(&self.originator)
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::broadcast()
    }
}

fn node_part(channel_id: &str) -> &str {
    channel_id
        .rsplit(NODE_SEPARATOR)
        .next()
        .unwrap_or(channel_id)
}

/// A typed message that can travel over the bus
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire tag of this type, unique across the bus
    const TYPE_TAG: &'static str;

    /// Type of the reply a receiver sends back; `()` for none
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn header(&self) -> &EventHeader;

    fn header_mut(&mut self) -> &mut EventHeader;

    /// View this event as the type identified by `type_id`, which is either
    /// the event's own type or a base type it extends
    fn view(&self, type_id: TypeId) -> Option<&dyn Any> {
        if type_id == TypeId::of::<Self>() {
            Some(self)
        } else {
            None
        }
    }
}

/// Object-safe view of an [`Event`] used by the decoder and the registry
pub trait AnyEvent: Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    fn envelope(&self) -> &EventHeader;

    fn envelope_mut(&mut self) -> &mut EventHeader;

    fn view_type(&self, type_id: TypeId) -> Option<&dyn Any>;

    fn to_json(&self) -> Result<String>;

    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> AnyEvent for E {
    fn tag(&self) -> &'static str {
        E::TYPE_TAG
    }

    fn envelope(&self) -> &EventHeader {
        self.header()
    }

    fn envelope_mut(&mut self) -> &mut EventHeader {
        self.header_mut()
    }

    fn view_type(&self, type_id: TypeId) -> Option<&dyn Any> {
        self.view(type_id)
    }

    fn to_json(&self) -> Result<String> {
        codec::encode_event(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for dyn AnyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyEvent")
            .field("tag", &self.tag())
            .field("header", self.envelope())
            .finish()
    }
}

/// Liveness probe every bus understands; answered with a null response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingEvent {
    #[serde(flatten)]
    pub header: EventHeader,
}

impl PingEvent {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(target),
        }
    }
}

impl Event for PingEvent {
    const TYPE_TAG: &'static str = "PingEvent";
    type Response = ();

    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }
}
