//! Multi-node scenarios over one in-memory broker

mod common;

use common::{eventually, TestCluster, CHANNEL};
use futures::StreamExt;
use relaybus::{
    event_handlers, DiscoveredHandler, Event, EventHeader, Reply, ResponseEvent, Transport,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Event, Serialize, Deserialize, Clone, Debug, Default)]
#[event(tag = "OrderPlaced", response = u64)]
pub struct OrderPlaced {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order: u64,
}

#[derive(Event, Serialize, Deserialize, Clone, Debug, Default)]
#[event(tag = "RushOrderPlaced", response = u64)]
pub struct RushOrderPlaced {
    #[serde(flatten)]
    #[event(extends)]
    pub base: OrderPlaced,
    pub hours: u32,
}

#[derive(Event, Serialize, Deserialize, Clone, Debug, Default)]
#[event(tag = "StockCheck", response = u32)]
pub struct StockCheck {
    #[serde(flatten)]
    pub header: EventHeader,
    pub sku: u32,
}

fn order_to(target: &str, order: u64) -> OrderPlaced {
    OrderPlaced {
        header: EventHeader::new(target),
        order,
    }
}

#[derive(Default)]
pub struct Billing {
    journal: Mutex<Vec<String>>,
}

impl Billing {
    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

#[event_handlers]
impl Billing {
    #[handler(priority = 20)]
    fn invoice(&self, event: &OrderPlaced) -> Reply<u64> {
        self.journal.lock().unwrap().push(format!("invoice {}", event.order));
        Reply::new(event.order + 1000)
    }

    #[handler(priority = 10)]
    fn expedite(&self, event: &RushOrderPlaced) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("expedite {} in {}h", event.base.order, event.hours));
    }
}

#[derive(Default)]
pub struct Stock {
    checks: AtomicUsize,
}

#[event_handlers]
impl Stock {
    #[handler]
    fn check(&self, event: &StockCheck) -> Reply<u32> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Reply::new(event.sku * 10)
    }

    #[handler]
    fn slow(&self, event: &OrderPlaced) -> Option<Reply<u64>> {
        std::thread::sleep(Duration::from_millis(150));
        Some(Reply::new(event.order))
    }
}

#[tokio::test]
async fn test_subtype_reaches_base_handler_across_nodes() {
    let cluster = TestCluster::new();
    let billing = Arc::new(Billing::default());

    let web = cluster
        .node("web", |b| b.with_event::<RushOrderPlaced>(), vec![])
        .await
        .unwrap();
    let billing_node = cluster
        .node(
            "billing",
            |b| b.with_event::<OrderPlaced>().with_event::<RushOrderPlaced>(),
            vec![],
        )
        .await
        .unwrap();
    billing_node.register(billing.clone());

    let rush = RushOrderPlaced {
        base: order_to("billing", 7),
        hours: 4,
    };
    let response = web.request(rush).await.unwrap();

    assert!(!response.has_timed_out());
    assert_eq!(response.payload().unwrap(), Some(1007));
    assert_eq!(billing.journal(), vec!["expedite 7 in 4h", "invoice 7"]);
}

#[tokio::test]
async fn test_node_without_type_drops_event() {
    let cluster = TestCluster::new();
    let web = cluster.node("web", |b| b, vec![]).await.unwrap();
    let _stock = cluster
        .node("stock", |b| b, DiscoveredHandler::of::<Stock>())
        .await
        .unwrap();

    // stock never registered StockCheck as decodable
    let response = web
        .request(StockCheck {
            header: EventHeader::new("stock"),
            sku: 1,
        })
        .await
        .unwrap();
    assert!(response.has_timed_out());
    assert_eq!(web.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_correlate() {
    let cluster = TestCluster::new();
    let web = cluster
        .node("web", |b| b.with_event::<StockCheck>(), vec![])
        .await
        .unwrap();
    let stock = cluster
        .node(
            "stock",
            |b| b.with_event::<StockCheck>(),
            DiscoveredHandler::of::<Stock>(),
        )
        .await
        .unwrap();

    let requests = (1..=40u32).map(|sku| {
        let web = web.clone();
        async move {
            let response = web
                .send_and_wait(
                    StockCheck {
                        header: EventHeader::new("stock"),
                        sku,
                    },
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            (sku, response.payload().unwrap())
        }
    });

    for (sku, payload) in futures::future::join_all(requests).await {
        assert_eq!(payload, Some(sku * 10));
    }
    assert_eq!(web.pending_count(), 0);
    assert_eq!(stock.registry().len(), 3);
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_ignored() {
    let cluster = TestCluster::new();
    let web = cluster.node("web", |b| b, vec![]).await.unwrap();
    let _stock = cluster
        .node(
            "stock",
            |b| b.with_event::<OrderPlaced>(),
            DiscoveredHandler::of::<Stock>(),
        )
        .await
        .unwrap();

    let response = web
        .send_and_wait(order_to("stock", 3), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(response.has_timed_out());

    // The reply still arrives and finds no slot
    assert!(eventually(|| !cluster.broker.published_on("cluster#web").is_empty()).await);
    assert_eq!(web.pending_count(), 0);
}

#[tokio::test]
async fn test_external_node_wire_compatibility() {
    let cluster = TestCluster::new();
    let billing = Arc::new(Billing::default());
    let node = cluster
        .node("billing", |b| b.with_event::<OrderPlaced>(), vec![])
        .await
        .unwrap();
    node.register(billing.clone());

    let legacy = cluster.broker.transport();
    let mut replies = legacy
        .subscribe(&["cluster#legacy".to_string()], &[])
        .await
        .unwrap();

    legacy
        .publish(
            "cluster#billing",
            r#"{"className":"OrderPlaced","id":5,"originator":"cluster#legacy","redisTarget":"cluster#billing","order":9}"#,
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&reply.payload).unwrap();
    assert_eq!(value["className"], "ResponseEvent");
    assert_eq!(value["id"], 5);
    assert_eq!(value["originator"], "cluster#billing");
    assert_eq!(value["redisTarget"], "cluster#legacy");
    assert_eq!(value["response"], "1009");
    assert_eq!(value["responseClassName"], "u64");
}

#[tokio::test]
async fn test_external_responder() {
    let cluster = TestCluster::new();
    let web = cluster.node("web", |b| b, vec![]).await.unwrap();

    let responder = cluster.broker.transport();
    let mut inbox = responder
        .subscribe(&[format!("{CHANNEL}#pricing")], &[])
        .await
        .unwrap();

    let answer = tokio::spawn(async move {
        let message = inbox.next().await.unwrap().unwrap();
        let request: OrderPlaced = relaybus::codec::decode_event(&message.payload).unwrap();
        let response = ResponseEvent::for_request(request.header(), Some(&99u64)).unwrap();
        responder
            .publish(&request.header.originator, &response.encode().unwrap())
            .await
            .unwrap();
    });

    let response = web
        .send_and_wait(order_to("pricing", 1), Duration::from_secs(2))
        .await
        .unwrap();
    answer.await.unwrap();

    assert_eq!(response.payload().unwrap(), Some(99));
    assert!(response.payload_type_tag().ends_with("u64"));
}

#[tokio::test]
async fn test_null_reply_reads_as_none() {
    let cluster = TestCluster::new();
    let web = cluster.node("web", |b| b, vec![]).await.unwrap();
    let _peer = cluster.node("peer", |b| b, vec![]).await.unwrap();

    let response = web
        .send_and_wait(relaybus::PingEvent::new("peer"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(response.is_finished());
    assert_eq!(response.payload().unwrap(), None);
    assert_eq!(response.payload_type_tag(), "");
}

#[tokio::test]
async fn test_deferred_reply_from_another_bus() {
    let cluster = TestCluster::new();
    let web = cluster.node("web", |b| b, vec![]).await.unwrap();
    let pricing = cluster.node("pricing", |b| b, vec![]).await.unwrap();

    // Requests are picked up outside the handler registry and answered later
    let tap = cluster.broker.transport();
    let mut inbox = tap
        .subscribe(&[format!("{CHANNEL}#pricing")], &[])
        .await
        .unwrap();

    let first = web.send(order_to("pricing", 4)).await.unwrap();
    let second = web.send(order_to("pricing", 5)).await.unwrap();
    assert_eq!(web.pending_count(), 2);

    let mut requests = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(2), inbox.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let request: OrderPlaced = relaybus::codec::decode_event(&message.payload).unwrap();
        requests.push(request);
    }
    requests.sort_by_key(|request| request.order);

    pricing
        .reply(&requests[0], requests[0].order * 100)
        .await
        .unwrap();
    pricing.reply_null(&requests[1]).await;

    let first = first.wait(Duration::from_secs(2)).await;
    let second = second.wait(Duration::from_secs(2)).await;
    assert_eq!(first.payload().unwrap(), Some(400));
    assert!(second.is_finished());
    assert_eq!(second.payload().unwrap(), None);
    assert_eq!(web.pending_count(), 0);
    assert_eq!(pricing.pending_count(), 0);
}
