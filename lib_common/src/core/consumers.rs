//! Ready-made consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::fanout::Consumer;
use crate::core::payload::{Delivery, Origin};
use crate::errors::ConsumerError;

/// Totals for one origin tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OriginTotals {
    /// Deliveries seen.
    pub messages: u64,
    /// Payload bytes seen.
    pub bytes: u64,
}

#[derive(Default)]
struct StatsInner {
    primary_messages: AtomicU64,
    primary_bytes: AtomicU64,
    secondary_messages: AtomicU64,
    secondary_bytes: AtomicU64,
    last_received: Mutex<Option<DateTime<Utc>>>,
}

/// # Receive Statistics
///
/// Counts deliveries and payload bytes per origin. Clones share counters, so
/// register one clone and read from another.
#[derive(Clone, Default)]
pub struct ReceiveStats {
    inner: Arc<StatsInner>,
}

impl ReceiveStats {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals for one origin.
    pub fn totals(&self, origin: Origin) -> OriginTotals {
        let (messages, bytes) = match origin {
            Origin::Primary => (&self.inner.primary_messages, &self.inner.primary_bytes),
            Origin::Secondary => (&self.inner.secondary_messages, &self.inner.secondary_bytes),
        };
        OriginTotals {
            messages: messages.load(Ordering::Relaxed),
            bytes: bytes.load(Ordering::Relaxed),
        }
    }

    /// Receive time of the most recent delivery.
    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_received.lock().expect("ReceiveStats lock poisoned")
    }
}

impl Consumer for ReceiveStats {
    fn deliver(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let (messages, bytes) = match delivery.origin {
            Origin::Primary => (&self.inner.primary_messages, &self.inner.primary_bytes),
            Origin::Secondary => (&self.inner.secondary_messages, &self.inner.secondary_bytes),
        };
        messages.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(delivery.payload.len() as u64, Ordering::Relaxed);
        *self.inner.last_received.lock().expect("ReceiveStats lock poisoned") = Some(delivery.received_at);
        Ok(())
    }
}

/// # Channel Consumer
///
/// Hands each delivery to an async task through an unbounded queue, so slow
/// processing never holds up the dispatch loop. Fails once the receiving end
/// is gone.
pub struct ChannelConsumer {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ChannelConsumer {
    /// A consumer plus the receiver its deliveries arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Consumer for ChannelConsumer {
    fn deliver(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        self.sender
            .send(delivery.clone())
            .map_err(|_| ConsumerError::new("receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::Payload;

    #[test]
    fn test_stats_split_by_origin() {
        let stats = ReceiveStats::new();
        let reader = stats.clone();

        stats.deliver(&Delivery::primary(Payload::from("12345"))).unwrap();
        stats.deliver(&Delivery::primary(Payload::from("1"))).unwrap();
        stats.deliver(&Delivery::secondary(Payload::from("123"), "t")).unwrap();

        assert_eq!(reader.totals(Origin::Primary), OriginTotals { messages: 2, bytes: 6 });
        assert_eq!(reader.totals(Origin::Secondary), OriginTotals { messages: 1, bytes: 3 });
        assert!(reader.last_received().is_some());
    }

    #[tokio::test]
    async fn test_channel_consumer_forwards_and_fails_when_closed() {
        let (consumer, mut rx) = ChannelConsumer::channel();
        consumer.deliver(&Delivery::primary(Payload::from("x"))).unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, Payload::from("x"));

        drop(rx);
        assert!(consumer.deliver(&Delivery::primary(Payload::from("y"))).is_err());
    }
}
