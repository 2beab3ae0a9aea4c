//! Two nodes sharing stock queries and restock broadcasts
//!
//! Runs on the in-process broker by default; `inventory redis` talks to a
//! local Redis server when built with the `redis` feature.

use anyhow::Result;
use relaybus::{
    event_handlers, Bus, BusBuilder, BusConfig, DiscoveredHandler, Event, EventHeader,
    MemoryBroker, Reply,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::info;

#[derive(Event, Serialize, Deserialize, Debug, Clone, Default)]
#[event(tag = "StockQuery", response = u32)]
pub struct StockQuery {
    #[serde(flatten)]
    pub header: EventHeader,
    pub sku: String,
}

#[derive(Event, Serialize, Deserialize, Debug, Clone, Default)]
#[event(tag = "Restocked")]
pub struct Restocked {
    #[serde(flatten)]
    pub header: EventHeader,
    pub sku: String,
    pub quantity: u32,
}

pub struct Warehouse {
    shelves: Mutex<HashMap<String, u32>>,
}

impl Default for Warehouse {
    fn default() -> Self {
        let shelves = [("A-1".to_string(), 12), ("B-7".to_string(), 0)];
        Self {
            shelves: Mutex::new(shelves.into_iter().collect()),
        }
    }
}

#[event_handlers]
impl Warehouse {
    #[handler(priority = 10)]
    fn on_query(&self, query: &StockQuery) -> Reply<u32> {
        let shelves = self.shelves.lock().unwrap_or_else(|e| e.into_inner());
        let count = shelves.get(&query.sku).copied().unwrap_or(0);
        info!("📦 {} asks for {}: {} left", query.header.originator, query.sku, count);
        Reply::new(count)
    }

    #[handler]
    fn on_restock(&self, event: &Restocked) {
        let mut shelves = self.shelves.lock().unwrap_or_else(|e| e.into_inner());
        *shelves.entry(event.sku.clone()).or_insert(0) += event.quantity;
        info!("🚚 Restocked {} x{}", event.sku, event.quantity);
    }
}

fn node(config: BusConfig) -> BusBuilder {
    Bus::builder(config)
        .with_event::<StockQuery>()
        .with_event::<Restocked>()
}

async fn start(use_redis: bool) -> Result<(Bus, Bus)> {
    let warehouse = BusConfig::default()
        .with_channel_base("inventory")
        .with_channel("inventory")
        .with_node_name("warehouse");
    let shop = warehouse.clone().with_node_name("shop");

    let (warehouse, shop) = if use_redis {
        (node(warehouse), node(shop))
    } else {
        let broker = MemoryBroker::new();
        (
            node(warehouse).with_transport(broker.transport()),
            node(shop).with_transport(broker.transport()),
        )
    };

    let warehouse = warehouse
        .with_handlers(DiscoveredHandler::of::<Warehouse>())
        .build()
        .await?;
    let shop = shop.build().await?;

    for bus in [&warehouse, &shop] {
        if !bus.wait_until_subscribed(Duration::from_secs(5)).await {
            anyhow::bail!("{} could not subscribe", bus.node_id());
        }
    }
    Ok((warehouse, shop))
}

async fn run(shop: &Bus) -> Result<()> {
    let alive = shop.ping("warehouse", Duration::from_secs(1)).await?;
    info!("🏓 warehouse alive: {alive}");

    for sku in ["A-1", "B-7", "Z-0"] {
        let query = StockQuery {
            header: EventHeader::new("warehouse"),
            sku: sku.to_string(),
        };
        let response = shop.request(query).await?;
        if response.has_timed_out() {
            info!("⏰ No answer for {sku}");
        } else {
            info!("✅ {sku}: {:?}", response.payload()?);
        }
    }

    // Broadcast; the drop discards the reply handle
    drop(
        shop.send(Restocked {
            header: EventHeader::broadcast(),
            sku: "B-7".to_string(),
            quantity: 5,
        })
        .await?,
    );
    sleep(Duration::from_millis(200)).await;

    let count = shop
        .send_and_get(
            StockQuery {
                header: EventHeader::new("warehouse"),
                sku: "B-7".to_string(),
            },
            || info!("⏰ Warehouse went quiet"),
        )
        .await?;
    info!("✅ B-7 after restock: {count:?}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let use_redis = std::env::args().nth(1).as_deref() == Some("redis");
    let (warehouse, shop) = start(use_redis).await?;

    let outcome = run(&shop).await;

    shop.shutdown().await?;
    warehouse.shutdown().await?;
    info!("🎯 Demo completed");
    outcome
}
