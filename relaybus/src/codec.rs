//! JSON wire codec and dynamic type resolution

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::event::{AnyEvent, Event, PingEvent};
use crate::{Error, Result};

/// Wire field holding the type tag
pub const TYPE_TAG_FIELD: &str = "className";

/// Encode an event, forcing its type tag to `E::TYPE_TAG`
pub fn encode_event<E: Event>(event: &E) -> Result<String> {
    let mut value = serde_json::to_value(event)?;
    match &mut value {
        Value::Object(map) => {
            map.insert(
                TYPE_TAG_FIELD.to_string(),
                Value::String(E::TYPE_TAG.to_string()),
            );
        }
        _ => {
            return Err(Error::serialization_msg(format!(
                "event {} does not serialize to a JSON object",
                E::TYPE_TAG
            )))
        }
    }
    Ok(serde_json::to_string(&value)?)
}

/// Decode a payload as a known concrete event type
pub fn decode_event<E: Event>(payload: &str) -> Result<E> {
    Ok(serde_json::from_str(payload)?)
}

/// Read the type tag of a payload without decoding the rest of it
pub fn peek_type_tag(payload: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Tagged {
        #[serde(rename = "className", default)]
        type_tag: Option<String>,
    }

    let tagged: Tagged = serde_json::from_str(payload)?;
    match tagged.type_tag {
        Some(tag) if !tag.is_empty() => Ok(tag),
        _ => Err(Error::serialization_msg(format!(
            "payload carries no '{TYPE_TAG_FIELD}' field"
        ))),
    }
}

type DecodeFn = fn(&str) -> Result<Box<dyn AnyEvent>>;

fn decode_boxed<E: Event>(payload: &str) -> Result<Box<dyn AnyEvent>> {
    let event: E = decode_event(payload)?;
    Ok(Box::new(event))
}

/// Maps type tags to decode functions for the event types a node understands
#[derive(Clone)]
pub struct TypeRegistry {
    decoders: Arc<DashMap<&'static str, DecodeFn>>,
}

impl TypeRegistry {
    /// Registry pre-populated with the built-in event types
    pub fn new() -> Self {
        let registry = Self {
            decoders: Arc::new(DashMap::new()),
        };
        registry.register::<PingEvent>();
        registry
    }

    /// Make `E` decodable; re-registering a tag replaces its decoder
    pub fn register<E: Event>(&self) {
        self.decoders.insert(E::TYPE_TAG, decode_boxed::<E>);
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.decoders.iter().map(|entry| *entry.key()).collect();
        tags.sort_unstable();
        tags
    }

    /// Decode a payload into the event type named by its tag
    pub fn decode(&self, payload: &str) -> Result<Box<dyn AnyEvent>> {
        let type_tag = peek_type_tag(payload)?;
        let decode = self
            .decoders
            .get(type_tag.as_str())
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::type_resolution(type_tag.clone()))?;
        decode(payload)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}
