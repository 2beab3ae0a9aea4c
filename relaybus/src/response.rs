//! Response envelope and the request/response correlation primitives

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::event::EventHeader;
use crate::Result;

/// Reply to a correlated request
///
/// The reply value travels pre-encoded in `payload`, so the envelope decodes
/// without knowing the value's type; the requester decodes the payload when
/// it reads it. An empty payload together with an empty payload tag is a
/// null response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEvent {
    #[serde(flatten)]
    pub header: EventHeader,

    #[serde(rename = "response", default)]
    pub payload: String,

    #[serde(rename = "responseClassName", default)]
    pub payload_type_tag: String,
}

impl ResponseEvent {
    pub const TYPE_TAG: &'static str = "ResponseEvent";

    /// Response to `request` carrying `value`; `None` builds a null response
    pub fn for_request<T: Serialize>(request: &EventHeader, value: Option<&T>) -> Result<Self> {
        let (payload, payload_type_tag) = match value {
            Some(value) => {
                let encoded = serde_json::to_string(value)?;
                if encoded == "null" {
                    (String::new(), String::new())
                } else {
                    (encoded, std::any::type_name::<T>().to_string())
                }
            }
            None => (String::new(), String::new()),
        };
        Ok(Self::with_payload(request, payload, payload_type_tag))
    }

    /// Null response to `request`
    pub fn null_for(request: &EventHeader) -> Self {
        Self::with_payload(request, String::new(), String::new())
    }

    fn with_payload(request: &EventHeader, payload: String, payload_type_tag: String) -> Self {
        Self {
            header: EventHeader {
                type_tag: Self::TYPE_TAG.to_string(),
                correlation_id: request.correlation_id,
                originator: String::new(),
                target: request.originator.clone(),
            },
            payload,
            payload_type_tag,
        }
    }

    /// A missing value or a missing value tag both mean no value
    pub fn is_null(&self) -> bool {
        is_null_payload(&self.payload, &self.payload_type_tag)
    }

    /// Decode the nested reply value
    pub fn value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode_payload(&self.payload, &self.payload_type_tag)
    }

    pub fn encode(&self) -> Result<String> {
        let mut response = self.clone();
        response.header.type_tag = Self::TYPE_TAG.to_string();
        Ok(serde_json::to_string(&response)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

fn is_null_payload(payload: &str, payload_type_tag: &str) -> bool {
    payload.is_empty() || payload_type_tag.is_empty()
}

fn decode_payload<T: DeserializeOwned>(payload: &str, payload_type_tag: &str) -> Result<Option<T>> {
    if is_null_payload(payload, payload_type_tag) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(payload)?))
}

/// Value a handler sends back to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T>(Option<T>);

impl<T> Reply<T> {
    pub fn new(value: T) -> Self {
        Self(Some(value))
    }

    /// Reply that carries no value; the requester reads `None`
    pub fn null() -> Self {
        Self(None)
    }

    pub fn into_inner(self) -> Option<T> {
        self.0
    }
}

impl<T: Serialize> Reply<T> {
    /// Build the response envelope routed back to `request`'s originator
    pub fn into_response(self, request: &EventHeader) -> Result<ResponseEvent> {
        ResponseEvent::for_request(request, self.0.as_ref())
    }
}

/// Handler return values the registry understands
///
/// `()` sends nothing, [`Reply`] sends a response, `Option` sends when
/// `Some`, and an `Err` is logged as a handler failure.
pub trait IntoReply<R> {
    fn into_reply(self) -> std::result::Result<Option<Reply<R>>, String>;
}

impl<R> IntoReply<R> for () {
    fn into_reply(self) -> std::result::Result<Option<Reply<R>>, String> {
        Ok(None)
    }
}

impl<R> IntoReply<R> for Reply<R> {
    fn into_reply(self) -> std::result::Result<Option<Reply<R>>, String> {
        Ok(Some(self))
    }
}

impl<R, T: IntoReply<R>> IntoReply<R> for Option<T> {
    fn into_reply(self) -> std::result::Result<Option<Reply<R>>, String> {
        match self {
            Some(inner) => inner.into_reply(),
            None => Ok(None),
        }
    }
}

impl<R, T: IntoReply<R>, E: Display> IntoReply<R> for std::result::Result<T, E> {
    fn into_reply(self) -> std::result::Result<Option<Reply<R>>, String> {
        match self {
            Ok(inner) => inner.into_reply(),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SlotState {
    finished: bool,
    timed_out: bool,
    payload: String,
    payload_type_tag: String,
}

/// Process-local record of one outstanding correlated send
#[derive(Debug)]
pub(crate) struct PendingSlot {
    correlation_id: u64,
    state: Mutex<SlotState>,
    notify: Notify,
}

impl PendingSlot {
    pub(crate) fn new(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            state: Mutex::new(SlotState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Store the reply; only the first call on an open slot succeeds
    pub(crate) fn resolve(&self, payload: String, payload_type_tag: String) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.finished || state.timed_out {
                return false;
            }
            state.finished = true;
            state.payload = payload;
            state.payload_type_tag = payload_type_tag;
        }
        self.notify.notify_waiters();
        true
    }

    /// Fails when a reply already arrived
    pub(crate) fn mark_timed_out(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            return false;
        }
        state.timed_out = true;
        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    fn snapshot(&self) -> SlotState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) type PendingTable = Arc<DashMap<u64, Arc<PendingSlot>>>;

/// Outcome of waiting on a correlated send
#[derive(Debug, Clone)]
pub struct Response<T> {
    correlation_id: u64,
    finished: bool,
    timed_out: bool,
    payload: String,
    payload_type_tag: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Response<T> {
    fn from_state(correlation_id: u64, state: SlotState) -> Self {
        Self {
            correlation_id,
            finished: state.finished,
            timed_out: state.timed_out,
            payload: state.payload,
            payload_type_tag: state.payload_type_tag,
            _marker: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Tag of the reply value as sent by the responder; empty for null
    pub fn payload_type_tag(&self) -> &str {
        &self.payload_type_tag
    }

    pub fn raw_payload(&self) -> &str {
        &self.payload
    }

    /// Decode the reply; `None` on timeout or a null response
    pub fn payload(&self) -> Result<Option<T>> {
        if !self.finished {
            return Ok(None);
        }
        decode_payload(&self.payload, &self.payload_type_tag)
    }
}

/// Handle on an outstanding send
///
/// Dropping the handle releases the slot, so a reply arriving later is
/// ignored.
#[must_use = "dropping a PendingResponse discards the reply"]
pub struct PendingResponse<T> {
    slot: Arc<PendingSlot>,
    table: PendingTable,
    granularity: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PendingResponse<T> {
    pub(crate) fn new(slot: Arc<PendingSlot>, table: PendingTable, granularity: Duration) -> Self {
        Self {
            slot,
            table,
            granularity,
            _marker: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.slot.correlation_id()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.is_finished()
    }

    /// Wait until the reply arrives or `timeout` elapses
    pub async fn wait(self, timeout: Duration) -> Response<T> {
        // No deadline when `timeout` overflows the clock; wait until answered
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.slot.notify.notified();
            if self.slot.is_finished() {
                break;
            }
            let now = Instant::now();
            let Some(deadline) = deadline else {
                let _ = tokio::time::timeout(self.granularity, notified).await;
                continue;
            };
            if now >= deadline {
                if self.slot.mark_timed_out() {
                    debug!(
                        correlation_id = self.correlation_id(),
                        ?timeout,
                        "Response timed out"
                    );
                }
                break;
            }
            let step = (deadline - now).min(self.granularity);
            let _ = tokio::time::timeout(step, notified).await;
        }

        self.release();
        Response::from_state(self.correlation_id(), self.slot.snapshot())
    }
}

impl<T> PendingResponse<T> {
    fn release(&self) {
        let id = self.slot.correlation_id();
        self.table
            .remove_if(&id, |_, slot| Arc::ptr_eq(slot, &self.slot));
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> std::fmt::Debug for PendingResponse<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("correlation_id", &self.slot.correlation_id())
            .field("finished", &self.slot.is_finished())
            .finish()
    }
}
