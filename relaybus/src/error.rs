//! Error types for the relaybus library

use thiserror::Error;

/// Main error type for relaybus operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport layer errors not tied to a publish or subscribe call
    #[error("Transport layer error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Publishing a payload on a channel failed
    #[error("Failed to publish on channel '{channel}': {message}")]
    Publish {
        channel: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Subscribing failed or an active subscription dropped
    #[error("Subscription error: {message}")]
    Subscribe {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The type tag of an inbound message is not registered on this node
    #[error("Unknown event type '{type_tag}'")]
    TypeResolution { type_tag: String },

    /// Serialization and deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A registered handler panicked or returned an error
    #[error("Handler {declaring_type}::{method} failed on {event_type}: {message}")]
    HandlerInvocation {
        declaring_type: String,
        method: String,
        event_type: String,
        message: String,
    },

    /// A handler method could not be registered
    #[error("Cannot register handler {declaring_type}::{method}: {reason}")]
    Registration {
        declaring_type: String,
        method: String,
        reason: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Runtime errors
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a transport error with source
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a publish error with source
    pub fn publish<E>(channel: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Publish {
            channel: channel.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a publish error without source
    pub fn publish_msg(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a subscribe error with source
    pub fn subscribe<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Subscribe {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a subscribe error without source
    pub fn subscribe_msg(message: impl Into<String>) -> Self {
        Self::Subscribe {
            message: message.into(),
            source: None,
        }
    }

    /// Create a type resolution error
    pub fn type_resolution(type_tag: impl Into<String>) -> Self {
        Self::TypeResolution {
            type_tag: type_tag.into(),
        }
    }

    /// Create a serialization error with source
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error without source
    pub fn serialization_msg(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler invocation error
    pub fn handler_invocation(
        declaring_type: impl Into<String>,
        method: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HandlerInvocation {
            declaring_type: declaring_type.into(),
            method: method.into(),
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    /// Create a registration error
    pub fn registration(
        declaring_type: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Registration {
            declaring_type: declaring_type.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field,
        }
    }

    /// Create a runtime error with source
    pub fn runtime<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a runtime error without source
    pub fn runtime_msg(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Publish { .. } => true,
            Error::Subscribe { .. } => true,
            Error::Io { .. } => true,
            Error::Runtime { .. } => true,
            Error::TypeResolution { .. } => false,
            Error::Serialization { .. } => false,
            Error::HandlerInvocation { .. } => false,
            Error::Registration { .. } => false,
            Error::Configuration { .. } => false,
        }
    }

    /// Get error category for debugging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "transport",
            Error::Publish { .. } => "publish",
            Error::Subscribe { .. } => "subscribe",
            Error::TypeResolution { .. } => "type_resolution",
            Error::Serialization { .. } => "serialization",
            Error::HandlerInvocation { .. } => "handler",
            Error::Registration { .. } => "registration",
            Error::Configuration { .. } => "configuration",
            Error::Io { .. } => "io",
            Error::Runtime { .. } => "runtime",
        }
    }
}

// Implement From traits for common error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization("JSON serialization failed", err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::runtime("Task join failed", err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::transport("Redis command failed", err)
    }
}

/// Result type for relaybus operations
pub type Result<T> = std::result::Result<T, Error>;
