//! Redis pub/sub transport

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::config::BusConfig;
use crate::transport::{InboundMessage, MessageStream, Transport};
use crate::{Error, Result};

/// Transport speaking to a Redis-compatible server
///
/// Publishes go through one shared multiplexed connection, re-opened after a
/// failure. Every subscription owns a dedicated pub/sub connection; its
/// stream ends when that connection drops.
pub struct RedisTransport {
    client: redis::Client,
    publisher: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisTransport {
    /// Open a client for the server named in `config` and check it answers
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|e| Error::transport("Invalid Redis connection settings", e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::transport("Failed to connect to Redis", e))?;

        tracing::info!(host = %config.host, port = config.port, "Connected to Redis");
        Ok(Self {
            client,
            publisher: Mutex::new(Some(connection)),
        })
    }

    async fn publisher(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut cached = self.publisher.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::transport("Failed to connect to Redis", e))?;
        *cached = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut connection = self
            .publisher()
            .await
            .map_err(|e| Error::publish(channel, "no connection", e))?;

        let result: redis::RedisResult<i64> = connection.publish(channel, payload).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                *self.publisher.lock().await = None;
                Err(Error::publish(channel, "PUBLISH failed", e))
            }
        }
    }

    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<MessageStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::subscribe("Failed to open pub/sub connection", e))?;

        for channel in channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| Error::subscribe(format!("SUBSCRIBE {channel} failed"), e))?;
        }
        for pattern in patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| Error::subscribe(format!("PSUBSCRIBE {pattern} failed"), e))?;
        }

        let stream = pubsub.into_on_message().filter_map(|message| async move {
            let channel = message.get_channel_name().to_string();
            match message.get_payload::<String>() {
                Ok(payload) => Some(Ok(InboundMessage { channel, payload })),
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "Dropping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        *self.publisher.lock().await = None;
        Ok(())
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("connection_info", self.client.get_connection_info())
            .finish()
    }
}
