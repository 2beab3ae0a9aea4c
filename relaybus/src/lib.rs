//! # relaybus - Distributed event bus over publish/subscribe
//!
//! Nodes exchange typed events over a pub/sub server. Every event carries a
//! type tag so the receiver can decode it, a target naming one node or all
//! of them, and a correlation id so a receiver's reply finds its way back to
//! the waiting sender.
//!
//! ## Quick Start
//!
//! ### Events and handlers
//!
//! ```rust,ignore
//! use relaybus::{event_handlers, Bus, BusConfig, DiscoveredHandler, Event, EventHeader, Reply};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Event, Serialize, Deserialize, Debug, Clone)]
//! #[event(tag = "StockQuery", response = u32)]
//! pub struct StockQuery {
//!     #[serde(flatten)]
//!     pub header: EventHeader,
//!     pub sku: String,
//! }
//!
//! #[derive(Default)]
//! pub struct Warehouse;
//!
//! #[event_handlers]
//! impl Warehouse {
//!     #[handler(priority = 10)]
//!     fn on_query(&self, query: &StockQuery) -> Reply<u32> {
//!         Reply::new(if query.sku == "A-1" { 12 } else { 0 })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> relaybus::Result<()> {
//!     let bus = Bus::builder(BusConfig::default().with_node_name("stock"))
//!         .with_event::<StockQuery>()
//!         .with_handlers(DiscoveredHandler::of::<Warehouse>())
//!         .build()
//!         .await?;
//!
//!     let query = StockQuery { header: EventHeader::new("stock"), sku: "A-1".into() };
//!     let response = bus.request(query).await?;
//!     assert_eq!(response.payload()?, Some(12));
//!     Ok(())
//! }
//! ```
//!
//! ### Fire and forget
//!
//! `Bus::send` returns as soon as the event is published; drop the returned
//! handle when no reply is expected. Events targeted at `"*"` reach every
//! node.
//!
//! ## Transports
//!
//! - [`MemoryTransport`] - in-process broker, used by tests and single-process setups
//! - `RedisTransport` - Redis pub/sub, behind the `redis` feature

extern crate self as relaybus;

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod response;
pub mod transport;
#[cfg(feature = "redis")]
pub mod transport_redis;

#[cfg(all(test, feature = "macros"))]
mod tests;


// Re-exports
pub use bus::{Bus, BusBuilder, SyncBus};
pub use codec::TypeRegistry;
pub use config::BusConfig;
pub use error::{Error, Result};
pub use event::{AnyEvent, Event, EventHeader, PingEvent};
pub use registry::{DiscoveredHandler, EventHandlers, HandlerInfo, HandlerMethod, HandlerRegistry};
pub use response::{IntoReply, PendingResponse, Reply, Response, ResponseEvent};
pub use transport::{InboundMessage, MemoryBroker, MemoryTransport, MessageStream, Transport};
#[cfg(feature = "redis")]
pub use transport_redis::RedisTransport;

// Re-export macros when feature is enabled
#[cfg(feature = "macros")]
pub use relaybus_macros::{event_handlers, handler, Event};

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
