//! The event bus: routing, correlation and the subscribe loop

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, TypeRegistry};
use crate::config::{BusConfig, BROADCAST};
use crate::event::{AnyEvent, Event, PingEvent};
use crate::registry::{DiscoveredHandler, EventHandlers, HandlerMethod, HandlerRegistry};
use crate::response::{PendingResponse, PendingSlot, PendingTable, Reply, Response, ResponseEvent};
use crate::transport::{InboundMessage, Transport};
use crate::{Error, Result};

/// Builder for [`Bus`]
pub struct BusBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    types: TypeRegistry,
    discovered: Vec<DiscoveredHandler>,
    subscribe: bool,
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            transport: None,
            types: TypeRegistry::new(),
            discovered: Vec::new(),
            subscribe: true,
        }
    }

    /// Use `transport` instead of connecting with the configured settings
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Make `E` decodable from inbound messages
    pub fn with_event<E: Event>(self) -> Self {
        self.types.register::<E>();
        self
    }

    /// Register scanner output when the bus is built
    pub fn with_handlers(mut self, discovered: impl IntoIterator<Item = DiscoveredHandler>) -> Self {
        self.discovered.extend(discovered);
        self
    }

    /// Build without starting the subscribe loop; call [`Bus::subscribe`] later
    pub fn without_subscription(mut self) -> Self {
        self.subscribe = false;
        self
    }

    pub async fn build(self) -> Result<Bus> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&self.config).await?,
        };

        let node_id = self.config.node_id();
        let broadcast_address = self.config.broadcast_address();
        let (ready, _) = watch::channel(false);
        let bus = Bus {
            inner: Arc::new(BusInner {
                debug: AtomicBool::new(self.config.debug),
                config: self.config,
                node_id,
                broadcast_address,
                transport,
                types: self.types,
                registry: Arc::new(HandlerRegistry::new()),
                pending: Arc::new(DashMap::new()),
                next_id: AtomicU64::new(0),
                ready,
                subscriber: Mutex::new(None),
            }),
        };

        bus.inner.registry.register(Arc::new(PingResponder));
        let registered = bus.inner.registry.register_discovered(self.discovered);
        info!(
            "🚌 Bus {} ready with {} discovered handlers",
            bus.inner.node_id, registered
        );

        if self.subscribe {
            bus.subscribe();
        }
        Ok(bus)
    }
}

#[cfg(feature = "redis")]
async fn default_transport(config: &BusConfig) -> Result<Arc<dyn Transport>> {
    let transport = crate::transport_redis::RedisTransport::connect(config).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "redis"))]
async fn default_transport(_config: &BusConfig) -> Result<Arc<dyn Transport>> {
    Err(Error::configuration(
        "no transport given; call with_transport or enable the `redis` feature",
        None,
    ))
}

/// Answers every ping with a null response
#[derive(Default)]
struct PingResponder;

impl EventHandlers for PingResponder {
    fn handler_methods() -> Vec<HandlerMethod<Self>> {
        vec![HandlerMethod::new(
            "on_ping",
            i32::MIN,
            true,
            |_: &Self, _: &PingEvent| Reply::<()>::null(),
        )]
    }
}

struct BusInner {
    config: BusConfig,
    node_id: String,
    broadcast_address: String,
    transport: Arc<dyn Transport>,
    types: TypeRegistry,
    registry: Arc<HandlerRegistry>,
    pending: PendingTable,
    next_id: AtomicU64,
    debug: AtomicBool,
    ready: watch::Sender<bool>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on one node of the event bus
///
/// Cheap to clone; every clone drives the same node. The subscribe loop keeps
/// the node alive until [`Bus::shutdown`] or [`Bus::unsubscribe`].
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(config: BusConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    /// This node's channel id
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    /// Number of sends still awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Toggle per-message debug traces
    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }

    /// Register every handler method of `instance`
    pub fn register<T: EventHandlers>(&self, instance: Arc<T>) -> usize {
        self.inner.registry.register(instance)
    }

    /// Remove every handler bound to `instance`
    pub fn unregister<T: Send + Sync + 'static>(&self, instance: &Arc<T>) -> usize {
        self.inner.registry.unregister(instance)
    }

    /// Send an event, returning a handle on its reply
    ///
    /// Events addressed to this node are dispatched locally without touching
    /// the transport. A failed publish releases the reply slot and returns
    /// the error.
    pub async fn send<E: Event>(&self, mut event: E) -> Result<PendingResponse<E::Response>> {
        self.stamp(event.header_mut(), E::TYPE_TAG);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        event.header_mut().correlation_id = id;

        let slot = Arc::new(PendingSlot::new(id));
        self.inner.pending.insert(id, slot.clone());
        let pending = PendingResponse::new(
            slot,
            self.inner.pending.clone(),
            self.inner.config.wait_before_iteration(),
        );

        self.route(Box::new(event)).await?;
        Ok(pending)
    }

    /// Send and wait up to `timeout` for the reply
    pub async fn send_and_wait<E: Event>(
        &self,
        event: E,
        timeout: Duration,
    ) -> Result<Response<E::Response>> {
        let pending = self.send(event).await?;
        Ok(pending.wait(timeout).await)
    }

    /// Send and wait for the reply with the configured timeout
    pub async fn request<E: Event>(&self, event: E) -> Result<Response<E::Response>> {
        self.send_and_wait(event, self.inner.config.timeout()).await
    }

    /// Send and return the decoded reply; `on_timeout` runs when none arrives
    pub async fn send_and_get<E, F>(&self, event: E, on_timeout: F) -> Result<Option<E::Response>>
    where
        E: Event,
        F: FnOnce(),
    {
        let response = self.request(event).await?;
        if response.has_timed_out() {
            on_timeout();
            return Ok(None);
        }
        response.payload()
    }

    /// Send and handle the reply on a background task
    ///
    /// `on_failure` runs on timeout and when the send or the decode fails.
    pub fn send_and_execute<E, S, F>(&self, event: E, on_success: S, on_failure: F) -> JoinHandle<()>
    where
        E: Event,
        S: FnOnce(Option<E::Response>) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let bus = self.clone();
        tokio::spawn(async move {
            let response = match bus.request(event).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Send failed");
                    on_failure();
                    return;
                }
            };
            if response.has_timed_out() {
                on_failure();
                return;
            }
            match response.payload() {
                Ok(payload) => on_success(payload),
                Err(e) => {
                    warn!(
                        error = %e,
                        correlation_id = response.correlation_id(),
                        "Failed to decode reply"
                    );
                    on_failure();
                }
            }
        })
    }

    /// Check that `node` answers within `timeout`
    pub async fn ping(&self, node: &str, timeout: Duration) -> Result<bool> {
        let response = self.send_and_wait(PingEvent::new(node), timeout).await?;
        Ok(response.is_finished())
    }

    /// Send a response; never creates a reply slot
    ///
    /// A failed publish is logged and the response dropped.
    pub async fn respond(&self, mut response: ResponseEvent) {
        self.stamp(&mut response.header, ResponseEvent::TYPE_TAG);
        let target = response.header.target.clone();

        if target == self.inner.node_id {
            self.trace("Respond-Local", &target, &response.payload);
            self.resolve(&response);
            return;
        }

        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, correlation_id = response.header.correlation_id, "Failed to encode response");
                return;
            }
        };
        self.trace("Respond", &target, &payload);
        if let Err(e) = self.inner.transport.publish(&target, &payload).await {
            warn!(error = %e, correlation_id = response.header.correlation_id, "Dropping response");
        }
    }

    /// Reply to a received request with `value`
    pub async fn reply<E: Event>(&self, request: &E, value: E::Response) -> Result<()> {
        let response = ResponseEvent::for_request(request.header(), Some(&value))?;
        self.respond(response).await;
        Ok(())
    }

    /// Reply to a received request without a value
    pub async fn reply_null<E: Event>(&self, request: &E) {
        self.respond(ResponseEvent::null_for(request.header())).await;
    }

    /// Dispatch to local handlers on the calling task, bypassing the
    /// transport; replies are routed as usual
    pub async fn fire<E: Event>(&self, mut event: E) {
        if event.header().originator.is_empty() {
            event.header_mut().originator = self.inner.node_id.clone();
        }
        let replies = self.inner.registry.dispatch(&event);
        for reply in replies {
            self.respond(reply).await;
        }
    }

    /// Start the subscribe loop, replacing a running one
    pub fn subscribe(&self) {
        let mut subscriber = self
            .inner
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = subscriber.take() {
            info!("🔄 Interrupting running subscribe loop");
            previous.abort();
        }
        *subscriber = Some(tokio::spawn(self.clone().run_subscriber()));
    }

    /// Stop the subscribe loop
    pub fn unsubscribe(&self) {
        let handle = self
            .inner
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Subscribe loop stopped for {}", self.inner.node_id);
        }
        self.inner.ready.send_replace(false);
    }

    /// Whether the subscribe loop currently holds a live subscription
    pub fn is_subscribed(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the subscribe loop holds a live subscription
    pub async fn wait_until_subscribed(&self, timeout: Duration) -> bool {
        let mut ready = self.inner.ready.subscribe();
        let wait = async {
            loop {
                if *ready.borrow_and_update() {
                    return true;
                }
                if ready.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Stop the subscribe loop and close the transport
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Shutting down bus {}", self.inner.node_id);
        self.unsubscribe();
        self.inner.transport.close().await
    }

    fn stamp(&self, header: &mut crate::event::EventHeader, type_tag: &str) {
        header.type_tag = type_tag.to_string();
        header.originator = self.inner.node_id.clone();
        let target = if header.target.is_empty() {
            BROADCAST
        } else {
            header.target.as_str()
        };
        header.target = self.inner.config.resolve_target(target);
    }

    async fn route(&self, event: Box<dyn AnyEvent>) -> Result<()> {
        let target = event.envelope().target.clone();
        if target == self.inner.node_id {
            self.trace("Send-Local", &target, event.tag());
            self.spawn_dispatch(event);
            return Ok(());
        }

        let payload = event.to_json()?;
        self.trace("Send", &target, &payload);
        self.inner.transport.publish(&target, &payload).await
    }

    fn resolve(&self, response: &ResponseEvent) -> bool {
        let id = response.header.correlation_id;
        let slot = self.inner.pending.get(&id).map(|entry| entry.value().clone());
        match slot {
            Some(slot) => {
                slot.resolve(response.payload.clone(), response.payload_type_tag.clone())
            }
            None => {
                debug!(correlation_id = id, "No pending request for response");
                false
            }
        }
    }

    fn accepts(&self, target: &str) -> bool {
        target == self.inner.node_id || target == self.inner.broadcast_address
    }

    fn spawn_dispatch(&self, event: Box<dyn AnyEvent>) {
        let bus = self.clone();
        tokio::spawn(async move {
            let registry = bus.inner.registry.clone();
            match tokio::task::spawn_blocking(move || registry.dispatch(event.as_ref())).await {
                Ok(replies) => {
                    for reply in replies {
                        bus.respond(reply).await;
                    }
                }
                Err(e) => error!(error = %e, "Dispatch task failed"),
            }
        });
    }

    fn handle_inbound(&self, message: InboundMessage) {
        let payload = message.payload.trim();
        if payload.is_empty() {
            return;
        }

        let type_tag = match codec::peek_type_tag(payload) {
            Ok(type_tag) => type_tag,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Dropping undecodable message");
                return;
            }
        };

        if type_tag == ResponseEvent::TYPE_TAG {
            let response = match ResponseEvent::decode(payload) {
                Ok(response) => response,
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "Dropping undecodable response");
                    return;
                }
            };
            if response.header.target != self.inner.node_id {
                self.trace("Receive-Not-Allowed", &message.channel, payload);
                return;
            }
            self.trace("Receive-Response", &message.channel, payload);
            self.resolve(&response);
            return;
        }

        let event = match self.inner.types.decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Dropping message");
                return;
            }
        };
        if !self.accepts(&event.envelope().target) {
            self.trace("Receive-Not-Allowed", &message.channel, payload);
            return;
        }
        self.trace("Receive", &message.channel, payload);
        self.spawn_dispatch(event);
    }

    async fn run_subscriber(self) {
        let channels = vec![self.inner.config.channel.clone()];
        let patterns = vec![self.inner.config.wildcard_pattern()];
        let delay = self.inner.config.reconnect_delay();

        loop {
            match self.inner.transport.subscribe(&channels, &patterns).await {
                Ok(mut stream) => {
                    info!(
                        "📡 {} subscribed to {:?} and {:?}",
                        self.inner.node_id, channels, patterns
                    );
                    self.inner.ready.send_replace(true);
                    loop {
                        match stream.next().await {
                            Some(Ok(message)) => self.handle_inbound(message),
                            Some(Err(e)) => {
                                error!(error = %e, "Subscription dropped");
                                break;
                            }
                            None => {
                                error!("Subscription stream ended");
                                break;
                            }
                        }
                    }
                    self.inner.ready.send_replace(false);
                }
                Err(e) => error!(error = %e, "Failed to subscribe"),
            }

            error!("Lost connection to the pub/sub server. Retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
            info!("🔄 Re-subscribing {}", self.inner.node_id);
        }
    }

    fn trace(&self, direction: &str, channel: &str, payload: &str) {
        if self.inner.debug.load(Ordering::Relaxed) {
            debug!(node = %self.inner.node_id, "[{}] {}: {}", direction, channel, payload);
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("node_id", &self.inner.node_id)
            .field("pending", &self.inner.pending.len())
            .field("handlers", &self.inner.registry.len())
            .finish()
    }
}

/// Synchronous wrapper for [`Bus`]
pub struct SyncBus {
    runtime: tokio::runtime::Runtime,
    bus: Bus,
}

impl SyncBus {
    /// Build a bus on a runtime owned by the wrapper
    pub fn new(builder: BusBuilder) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::runtime("Failed to create runtime", e))?;
        let bus = runtime.block_on(builder.build())?;
        Ok(Self { runtime, bus })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn node_id(&self) -> &str {
        self.bus.node_id()
    }

    pub fn send<E: Event>(&self, event: E) -> Result<PendingResponse<E::Response>> {
        self.runtime.block_on(self.bus.send(event))
    }

    pub fn send_and_wait<E: Event>(
        &self,
        event: E,
        timeout: Duration,
    ) -> Result<Response<E::Response>> {
        self.runtime.block_on(self.bus.send_and_wait(event, timeout))
    }

    pub fn request<E: Event>(&self, event: E) -> Result<Response<E::Response>> {
        self.runtime.block_on(self.bus.request(event))
    }

    pub fn respond(&self, response: ResponseEvent) {
        self.runtime.block_on(self.bus.respond(response))
    }

    pub fn fire<E: Event>(&self, event: E) {
        self.runtime.block_on(self.bus.fire(event))
    }

    pub fn wait_until_subscribed(&self, timeout: Duration) -> bool {
        self.runtime.block_on(self.bus.wait_until_subscribed(timeout))
    }

    pub fn shutdown(self) -> Result<()> {
        self.runtime.block_on(self.bus.shutdown())
    }
}
