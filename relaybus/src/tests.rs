//! Bus tests over the in-memory broker
//! Covers local short-circuit, correlation, timeouts, filtering and reconnection

use crate::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Event, Serialize, Deserialize, Clone, Debug, Default)]
#[event(tag = "Add", response = i64)]
pub struct Add {
    #[serde(flatten)]
    pub header: EventHeader,
    pub a: i64,
    pub b: i64,
}

impl Add {
    pub fn to(target: &str, a: i64, b: i64) -> Self {
        Self {
            header: EventHeader::new(target),
            a,
            b,
        }
    }
}

#[derive(Event, Serialize, Deserialize, Clone, Debug, Default)]
#[event(tag = "Notice")]
pub struct Notice {
    #[serde(flatten)]
    pub header: EventHeader,
    pub text: String,
}

impl Notice {
    pub fn to(target: &str, text: &str) -> Self {
        Self {
            header: EventHeader::new(target),
            text: text.to_string(),
        }
    }
}

#[derive(Default)]
pub struct Calculator {
    calls: AtomicUsize,
}

#[event_handlers]
impl Calculator {
    #[handler]
    fn add(&self, event: &Add) -> Reply<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Reply::new(event.a + event.b)
    }
}

#[derive(Default)]
pub struct NoticeCounter {
    seen: AtomicUsize,
}

impl NoticeCounter {
    fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[event_handlers]
impl NoticeCounter {
    #[handler]
    fn on_notice(&self, _event: &Notice) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

/// Panics first, then a later handler still answers
#[derive(Default)]
pub struct Flaky;

#[event_handlers]
impl Flaky {
    #[handler(priority = -10)]
    fn explode(&self, _event: &Add) {
        panic!("flaky handler");
    }

    #[handler(priority = -5)]
    fn refuse(&self, _event: &Add) -> std::result::Result<(), String> {
        Err("refused".to_string())
    }
}

fn config(node: &str) -> BusConfig {
    BusConfig::default()
        .with_channel("test")
        .with_channel_base("test")
        .with_node_name(node)
        .with_timeout(Duration::from_millis(500))
        .with_wait_before_iteration(Duration::from_millis(10))
        .with_reconnect_delay(Duration::from_millis(50))
}

async fn node(broker: &MemoryBroker, name: &str) -> Bus {
    let bus = Bus::builder(config(name))
        .with_transport(broker.transport())
        .with_event::<Add>()
        .with_event::<Notice>()
        .build()
        .await
        .unwrap();
    assert!(bus.wait_until_subscribed(Duration::from_secs(2)).await);
    bus
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_send_skips_transport() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        let calculator = Arc::new(Calculator::default());
        let counter = Arc::new(NoticeCounter::default());
        bus.register(calculator.clone());
        bus.register(counter.clone());

        let response = bus
            .send_and_wait(Add::to("a", 2, 3), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!response.has_timed_out());
        assert_eq!(response.payload().unwrap(), Some(5));

        let _ = bus.send(Notice::to("a", "hello")).await.unwrap();
        assert!(eventually(|| counter.seen() == 1).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.seen(), 1);
        assert_eq!(calculator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.publish_count(), 0);

        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unbounded_wait_returns_on_reply() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        bus.register(Arc::new(Calculator::default()));

        let response = bus
            .send_and_wait(Add::to("a", 1, 2), Duration::MAX)
            .await
            .unwrap();
        assert!(!response.has_timed_out());
        assert_eq!(response.payload().unwrap(), Some(3));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_correlation_ids_start_at_one() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;

        let first = bus.send(Notice::to("b", "x")).await.unwrap();
        let second = bus.send(Notice::to("b", "y")).await.unwrap();
        assert_eq!(first.correlation_id(), 1);
        assert_eq!(second.correlation_id(), 2);
        assert_eq!(bus.pending_count(), 2);

        drop(first);
        assert_eq!(bus.pending_count(), 1);
        drop(second);
        assert_eq!(bus.pending_count(), 0);

        let published = broker.published_on("test#b");
        assert_eq!(published.len(), 2);
        let value: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(value["className"], "Notice");
        assert_eq!(value["id"], 1);
        assert_eq!(value["originator"], "test#a");
        assert_eq!(value["redisTarget"], "test#b");
    }

    #[tokio::test]
    async fn test_request_across_nodes() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;
        let b = node(&broker, "b").await;
        b.registry()
            .register_discovered(DiscoveredHandler::of::<Calculator>());

        let response = a
            .send_and_wait(Add::to("b", 20, 22), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.is_finished());
        assert!(!response.has_timed_out());
        assert_eq!(response.payload().unwrap(), Some(42));
        assert_eq!(response.payload_type_tag(), "i64");
        assert_eq!(a.pending_count(), 0);

        let replies = broker.published_on("test#a");
        assert_eq!(replies.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(value["className"], "ResponseEvent");
        assert_eq!(value["response"], "42");
    }

    #[tokio::test]
    async fn test_timeout_sets_flag_and_releases_slot() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;

        let started = Instant::now();
        let response = bus
            .send_and_wait(Notice::to("ghost", "anyone?"), Duration::from_millis(100))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(response.has_timed_out());
        assert!(!response.is_finished());
        assert_eq!(response.payload().unwrap(), None);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_returns_error() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        broker.set_fail_publishes(true);

        let err = bus.send(Add::to("b", 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Publish { ref channel, .. } if channel == "test#b"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_dispatch() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        bus.register(Arc::new(Flaky));
        bus.register(Arc::new(Calculator::default()));

        let response = bus.request(Add::to("a", 1, 2)).await.unwrap();
        assert_eq!(response.payload().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_messages_are_dropped() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;
        let b = node(&broker, "b").await;
        b.register(Arc::new(Calculator::default()));

        let raw = broker.transport();
        raw.publish("test#b", "").await.unwrap();
        raw.publish("test#b", "   ").await.unwrap();
        raw.publish("test#b", "{not json").await.unwrap();
        raw.publish("test#b", r#"{"className":"Mystery","redisTarget":"test#b"}"#)
            .await
            .unwrap();
        raw.publish("test#b", r#"{"id":3}"#).await.unwrap();

        let response = a.request(Add::to("b", 4, 4)).await.unwrap();
        assert_eq!(response.payload().unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_messages_for_other_nodes_are_filtered() {
        let broker = MemoryBroker::recording();
        let b = node(&broker, "b").await;
        let counter = Arc::new(NoticeCounter::default());
        b.register(counter.clone());

        // The bare channel reaches every node; the target still decides
        let raw = broker.transport();
        let foreign = Notice {
            header: EventHeader {
                type_tag: "Notice".to_string(),
                correlation_id: 1,
                originator: "test#x".to_string(),
                target: "test#c".to_string(),
            },
            text: "not for b".to_string(),
        };
        raw.publish("test", &foreign.to_json().unwrap()).await.unwrap();

        let mut mine = foreign.clone();
        mine.header.target = "test#b".to_string();
        raw.publish("test", &mine.to_json().unwrap()).await.unwrap();

        assert!(eventually(|| counter.seen() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.seen(), 1);
    }

    #[tokio::test]
    async fn test_response_for_other_node_is_ignored() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;

        let pending = a.send(Add::to("b", 1, 1)).await.unwrap();
        let request = EventHeader {
            type_tag: "Add".to_string(),
            correlation_id: pending.correlation_id(),
            originator: "test#someone-else".to_string(),
            target: "test#b".to_string(),
        };
        let stray = ResponseEvent::for_request(&request, Some(&2i64)).unwrap();
        broker
            .transport()
            .publish("test#a", &stray.encode().unwrap())
            .await
            .unwrap();

        let response = pending.wait(Duration::from_millis(100)).await;
        assert!(response.has_timed_out());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_node() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;
        let b = node(&broker, "b").await;
        let counter_a = Arc::new(NoticeCounter::default());
        let counter_b = Arc::new(NoticeCounter::default());
        a.register(counter_a.clone());
        b.register(counter_b.clone());

        let _ = a.send(Notice::to("*", "all hands")).await.unwrap();

        assert!(eventually(|| counter_a.seen() == 1 && counter_b.seen() == 1).await);
        assert_eq!(broker.published_on("test#*").len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_subscribe_failures() {
        let broker = MemoryBroker::recording();
        broker.fail_next_subscribes(2);

        let b = node(&broker, "b").await;
        assert_eq!(broker.subscribe_calls(), 3);
        let counter = Arc::new(NoticeCounter::default());
        b.register(counter.clone());

        let a = node(&broker, "a").await;
        let _ = a.send(Notice::to("b", "after reconnect")).await.unwrap();
        assert!(eventually(|| counter.seen() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.seen(), 1);
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;
        let b = node(&broker, "b").await;
        let counter = Arc::new(NoticeCounter::default());
        b.register(counter.clone());
        let calls_before = broker.subscribe_calls();

        broker.disconnect_all();
        assert!(eventually(|| broker.subscribe_calls() >= calls_before + 2).await);
        assert!(b.wait_until_subscribed(Duration::from_secs(2)).await);

        let _ = a.send(Notice::to("b", "still there")).await.unwrap();
        assert!(eventually(|| counter.seen() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.seen(), 1);
    }

    #[tokio::test]
    async fn test_send_and_execute_callbacks() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        bus.register(Arc::new(Calculator::default()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        bus.send_and_execute(
            Add::to("a", 5, 6),
            move |payload| {
                let _ = tx.send(payload);
            },
            || panic!("unexpected failure"),
        )
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Some(11));

        let failed = Arc::new(AtomicUsize::new(0));
        let flag = failed.clone();
        bus.send_and_execute(
            Notice::to("ghost", "hello?"),
            |_| panic!("unexpected reply"),
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_and_get() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        bus.register(Arc::new(Calculator::default()));

        let sum = bus.send_and_get(Add::to("a", 1, 1), || {}).await.unwrap();
        assert_eq!(sum, Some(2));

        let mut timed_out = false;
        let none = bus
            .send_and_get(Notice::to("ghost", "?"), || timed_out = true)
            .await
            .unwrap();
        assert_eq!(none, None);
        assert!(timed_out);
    }

    #[tokio::test]
    async fn test_ping() {
        let broker = MemoryBroker::recording();
        let a = node(&broker, "a").await;
        let _b = node(&broker, "b").await;

        assert!(a.ping("b", Duration::from_secs(1)).await.unwrap());
        assert!(a.ping("a", Duration::from_secs(1)).await.unwrap());
        assert!(!a.ping("ghost", Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fire_dispatches_inline() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        let counter = Arc::new(NoticeCounter::default());
        bus.register(counter.clone());

        bus.fire(Notice::to("a", "now")).await;
        assert_eq!(counter.seen(), 1);
        assert_eq!(broker.publish_count(), 0);

        assert_eq!(bus.unregister(&counter), 1);
        bus.fire(Notice::to("a", "again")).await;
        assert_eq!(counter.seen(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_resubscribe() {
        let broker = MemoryBroker::recording();
        let bus = node(&broker, "a").await;
        assert!(bus.is_subscribed());

        bus.unsubscribe();
        assert!(!bus.is_subscribed());

        bus.subscribe();
        assert!(bus.wait_until_subscribed(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let broker = MemoryBroker::recording();
        let err = Bus::builder(config("a#b"))
            .with_transport(broker.transport())
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_sync_bus() {
        let broker = MemoryBroker::recording();
        let builder = Bus::builder(config("sync"))
            .with_transport(broker.transport())
            .with_event::<Add>()
            .with_handlers(DiscoveredHandler::of::<Calculator>());
        let bus = SyncBus::new(builder).unwrap();
        assert_eq!(bus.node_id(), "test#sync");

        let response = bus.request(Add::to("sync", 7, 8)).unwrap();
        assert_eq!(response.payload().unwrap(), Some(15));
        bus.shutdown().unwrap();
    }
}
