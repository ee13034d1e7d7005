//! # Connections Module
//!
//! The primary-tier broker seam. Anything that can publish bytes to a named
//! channel and hand back a stream of the bytes published there is a `Broker`.
//!
//! - **`memory`**: in-process broker, always built.
//! - **`cache_redis`**: Redis pub/sub, behind the `connections` feature.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::errors::PublishError;

/// In-process broker with per-channel queues.
pub mod memory;

/// Redis pub/sub broker.
#[cfg(feature = "connections")]
pub mod cache_redis;

pub use memory::MemoryBroker;
#[cfg(feature = "connections")]
pub use cache_redis::RedisBroker;

/// Messages delivered on one channel, in broker order. The stream ends when
/// the broker connection behind it goes away.
pub type MessageStream = BoxStream<'static, Bytes>;

/// # Broker
///
/// Publish/subscribe by plain channel name. Channels exist implicitly; no
/// prefixing or namespacing is applied.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Hands `message` to the broker for `channel`.
    async fn publish(&self, channel: &str, message: Bytes) -> Result<(), PublishError>;

    /// Opens a subscription on `channel`. Every message published after this
    /// call returns is delivered on the stream.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, PublishError>;
}
