//! Transport layer - publish/subscribe abstraction and in-process broker

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crate::{Error, Result};

/// A payload delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}

/// Inbound messages of one subscription
///
/// The stream yields an `Err` or ends when the connection drops.
pub type MessageStream = BoxStream<'static, Result<InboundMessage>>;

/// Transport trait for abstracting the pub/sub server
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to exact channels and glob patterns in one subscription
    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<MessageStream>;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// Match a channel against a Redis-style glob pattern
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes. Matching is
/// bytewise.
pub fn channel_matches(channel: &str, pattern: &str) -> bool {
    if channel == pattern {
        return true;
    }
    glob_match(pattern.as_bytes(), channel.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let advance = match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some(b'?') => Some(1),
            Some(b'[') => {
                let (matched, len) = match_class(&pattern[p..], text[t]);
                matched.then_some(len)
            }
            Some(b'\\') if p + 1 < pattern.len() => (pattern[p + 1] == text[t]).then_some(2),
            Some(&c) => (c == text[t]).then_some(1),
            None => None,
        };

        if let Some(len) = advance {
            p += len;
            t += 1;
            continue;
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while pattern.get(p) == Some(&b'*') {
        p += 1;
    }
    p == pattern.len()
}

/// Match one byte against a `[...]` class at the start of `pattern`;
/// returns whether it matched and how many pattern bytes the class spans.
/// An unterminated class is a literal `[`.
fn match_class(pattern: &[u8], c: u8) -> (bool, usize) {
    let negate = pattern.get(1) == Some(&b'^');
    let mut i = if negate { 2 } else { 1 };
    let mut matched = false;

    loop {
        match pattern.get(i) {
            None => return (c == b'[', 1),
            Some(b']') => break,
            Some(b'\\') if i + 1 < pattern.len() => {
                matched |= pattern[i + 1] == c;
                i += 2;
            }
            Some(&low) if pattern.get(i + 1) == Some(&b'-') && pattern.get(i + 2).is_some_and(|&h| h != b']') => {
                let high = pattern[i + 2];
                let (low, high) = if low <= high { (low, high) } else { (high, low) };
                matched |= (low..=high).contains(&c);
                i += 3;
            }
            Some(&x) => {
                matched |= x == c;
                i += 1;
            }
        }
    }

    (matched != negate, i + 1)
}

#[derive(Debug, Clone)]
enum Signal {
    Message(InboundMessage),
    Disconnect,
}

struct BrokerInner {
    sender: broadcast::Sender<Signal>,
    recording: bool,
    published: Mutex<Vec<InboundMessage>>,
    publish_count: AtomicUsize,
    failing_subscribes: AtomicUsize,
    failing_publishes: AtomicBool,
    subscribe_calls: AtomicUsize,
}

/// In-process pub/sub broker shared by any number of [`MemoryTransport`]s
///
/// Counts publishes and can inject the failures a network broker produces.
/// A broker built with [`MemoryBroker::recording`] also keeps every published
/// payload for inspection.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_recording(false)
    }

    /// Broker that keeps a log of every publish
    pub fn recording() -> Self {
        Self::with_recording(true)
    }

    fn with_recording(recording: bool) -> Self {
        let (sender, _) = broadcast::channel(8192);
        Self {
            inner: Arc::new(BrokerInner {
                sender,
                recording,
                published: Mutex::new(Vec::new()),
                publish_count: AtomicUsize::new(0),
                failing_subscribes: AtomicUsize::new(0),
                failing_publishes: AtomicBool::new(false),
                subscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// A new client connection to this broker
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(self.clone()))
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording
    }

    /// Every recorded publish, in order; empty unless recording
    pub fn published(&self) -> Vec<InboundMessage> {
        self.published_log().clone()
    }

    /// Payloads published on `channel`
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published_log()
            .iter()
            .filter(|message| message.channel == channel)
            .map(|message| message.payload.clone())
            .collect()
    }

    /// Successful publishes, counted whether or not the broker records
    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::SeqCst)
    }

    pub fn clear_published(&self) {
        self.published_log().clear();
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_next_subscribes(&self, count: usize) {
        self.inner.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Make every publish fail until reset
    pub fn set_fail_publishes(&self, fail: bool) {
        self.inner.failing_publishes.store(fail, Ordering::SeqCst);
    }

    /// Terminate every open subscription with an error
    pub fn disconnect_all(&self) {
        let _ = self.inner.sender.send(Signal::Disconnect);
    }

    /// Number of subscribe calls made, failed ones included
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    fn published_log(&self) -> std::sync::MutexGuard<'_, Vec<InboundMessage>> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.inner.failing_publishes.load(Ordering::SeqCst) {
            return Err(Error::publish_msg(channel, "broker rejected publish"));
        }

        let message = InboundMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        self.inner.publish_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.recording {
            self.published_log().push(message.clone());
        }
        // No receivers is not an error for pub/sub
        let _ = self.inner.sender.send(Signal::Message(message));
        Ok(())
    }

    fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<MessageStream> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .inner
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::subscribe_msg("broker refused subscription"));
        }

        let mut receiver = self.inner.sender.subscribe();
        let (tx, rx) = mpsc::channel(4096);
        let channels = channels.to_vec();
        let patterns = patterns.to_vec();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Signal::Message(message)) => {
                        // One delivery per matching subscription, as a real broker does
                        let deliveries = channels.iter().filter(|c| **c == message.channel).count()
                            + patterns
                                .iter()
                                .filter(|p| channel_matches(&message.channel, p))
                                .count();
                        for _ in 0..deliveries {
                            if tx.send(Ok(message.clone())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Signal::Disconnect) => {
                        let _ = tx
                            .send(Err(Error::subscribe_msg("connection to broker lost")))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory subscription lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("recording", &self.inner.recording)
            .field("publish_count", &self.publish_count())
            .field("subscribe_calls", &self.subscribe_calls())
            .finish()
    }
}

/// Transport backed by a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport_msg("transport is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::publish_msg(channel, "transport is closed"));
        }
        self.broker.publish(channel, payload)
    }

    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<MessageStream> {
        self.ensure_open()?;
        self.broker.subscribe(channels, patterns)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
