//! # Redis Pub/Sub Broker
//!
//! Publishes through a shared `ConnectionManager` (reconnects on its own) and
//! opens one dedicated pub/sub connection per subscription, since a Redis
//! connection in subscribe mode cannot issue regular commands.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use super::{Broker, MessageStream};
use crate::errors::PublishError;

/// A broker backed by a Redis server.
pub struct RedisBroker {
    /// The Redis client, used to open pub/sub connections.
    client: Client,
    /// Multiplexed connection for PUBLISH.
    publisher: ConnectionManager,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1:6379/").
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let client = Client::open(url).map_err(|e| classify(url, e))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| classify(url, e))?;
        log::info!("Connected to Redis at {}", url);
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, message: Bytes) -> Result<(), PublishError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, message.as_ref())
            .await
            .map_err(|e| classify(channel, e))?;
        log::debug!("Published {} bytes to '{}' ({} receiver(s))", message.len(), channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, PublishError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| classify(channel, e))?;
        pubsub.subscribe(channel).await.map_err(|e| classify(channel, e))?;
        log::info!("Subscribed to Redis channel '{}'", channel);

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}

/// Connection-level failures mean the broker is unreachable; anything else is
/// the server refusing this particular request.
fn classify(channel: &str, err: RedisError) -> PublishError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        PublishError::Unreachable(err.to_string())
    } else {
        PublishError::Rejected {
            channel: channel.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("redis://127.0.0.1:{}/", port);
        match RedisBroker::connect(&url).await {
            Err(PublishError::Unreachable(_)) => {}
            Err(other) => panic!("expected Unreachable, got {:?}", other),
            Ok(_) => panic!("nothing should be listening on {}", url),
        }
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = Client::open("not-a-redis-url").unwrap_err();
        assert!(matches!(classify("c", err), PublishError::Rejected { .. }));
    }
}
