//! In-process broker.
//!
//! Each subscription owns an unbounded queue; a publish pushes into every
//! queue registered for the channel before it returns, so a subscriber that
//! exists at publish time never misses the message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::{Broker, MessageStream};
use crate::errors::PublishError;

#[derive(Default)]
struct Channels {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
}

/// # Memory Broker
///
/// Cheap to clone; clones share the same channel table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<Mutex<Channels>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// An empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock().expect("MemoryBroker lock poisoned");
        match channels.subscribers.get_mut(channel) {
            Some(list) => {
                list.retain(|tx| !tx.is_closed());
                list.len()
            }
            None => 0,
        }
    }

    /// Simulates losing the broker: while set, publish and subscribe fail with
    /// `PublishError::Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Ends every open subscription stream, as a dropped connection would.
    pub fn shutdown(&self) {
        let mut channels = self.channels.lock().expect("MemoryBroker lock poisoned");
        let dropped: usize = channels.subscribers.values().map(Vec::len).sum();
        channels.subscribers.clear();
        log::info!("MemoryBroker shut down, {} subscription(s) closed.", dropped);
    }

    fn check_reachable(&self) -> Result<(), PublishError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("memory broker offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, message: Bytes) -> Result<(), PublishError> {
        self.check_reachable()?;

        let mut channels = self.channels.lock().expect("MemoryBroker lock poisoned");
        if let Some(list) = channels.subscribers.get_mut(channel) {
            // Bytes clones share one buffer; closed receivers are pruned here.
            list.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, PublishError> {
        self.check_reachable()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .expect("MemoryBroker lock poisoned")
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (msg, rx)) });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_existing_subscriber() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe("app:notifications").await.unwrap();
        let mut second = broker.subscribe("app:notifications").await.unwrap();
        let mut other = broker.subscribe("elsewhere").await.unwrap();

        broker.publish("app:notifications", Bytes::from_static(b"one")).await.unwrap();
        broker.publish("app:notifications", Bytes::from_static(b"two")).await.unwrap();
        broker.shutdown();

        assert_eq!(first.next().await.unwrap(), "one");
        assert_eq!(first.next().await.unwrap(), "two");
        assert_eq!(second.next().await.unwrap(), "one");
        assert_eq!(second.next().await.unwrap(), "two");
        assert!(first.next().await.is_none());
        assert!(other.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_accepted() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("nobody", Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let broker = MemoryBroker::new();
        let stream = broker.subscribe("c").await.unwrap();
        assert_eq!(broker.subscriber_count("c"), 1);
        drop(stream);
        broker.publish("c", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(broker.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_error() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let err = broker.publish("c", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, PublishError::Unreachable(_)));
        assert!(broker.subscribe("c").await.is_err());

        broker.set_unreachable(false);
        assert!(broker.publish("c", Bytes::from_static(b"x")).await.is_ok());
    }
}
