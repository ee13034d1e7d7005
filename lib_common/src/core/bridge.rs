//! # Channel Bridge
//!
//! Moves bytes between local consumers and a broker channel. The bridge owns
//! its broker handle; nothing else in the process talks to the broker for it.
//!
//! Two ways in:
//!
//! - **Callback subscriptions**: `subscribe` runs a handler once per broker
//!   message, in broker order, until the returned `Subscription` is cancelled
//!   or dropped.
//! - **Transport relay**: `relay` shares one broker subscription among any
//!   number of local transports (e.g. WebSocket sessions). Inbound bytes from
//!   a transport are republished verbatim, and every broker message is pushed
//!   out to every connected transport. Fan-out clones a `Bytes` handle per
//!   transport, never the buffer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connections::{Broker, MessageStream};
use crate::core::payload::Payload;
use crate::errors::PublishError;

/// # Channel Bridge
pub struct ChannelBridge {
    broker: Arc<dyn Broker>,
    /// Live relays by channel. Weak so a relay with no remaining holders drops
    /// its broker subscription.
    relays: tokio::sync::Mutex<HashMap<String, Weak<Relay>>>,
}

impl ChannelBridge {
    /// Creates a bridge that owns `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            relays: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Hands the payload bytes to the broker. Re-publishing the same payload is
    /// always accepted; nothing is deduplicated.
    pub async fn publish(&self, channel: &str, payload: &Payload) -> Result<(), PublishError> {
        self.broker.publish(channel, payload.clone().into_bytes()).await
    }

    /// # Subscribe
    ///
    /// Runs `on_message` once per message the broker delivers on `channel`.
    /// Cancelling the subscription affects no other subscriber of the channel.
    pub async fn subscribe<F>(&self, channel: &str, on_message: F) -> Result<Subscription, PublishError>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let stream = self.broker.subscribe(channel).await?;
        let name = channel.to_string();
        Ok(Subscription::spawn(channel, stream, on_message, move || {
            log::warn!("Broker stream for '{}' ended.", name);
        }))
    }

    /// Like [`subscribe`](Self::subscribe), but delivers onto a queue so the
    /// caller can compose it with other message-passing stages.
    pub async fn subscribe_stream(
        &self,
        channel: &str,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Bytes>), PublishError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .subscribe(channel, move |message| {
                // A dropped receiver just means nobody is listening anymore.
                let _ = tx.send(message);
            })
            .await?;
        Ok((subscription, rx))
    }

    /// # Relay
    ///
    /// Returns the relay for `channel`, opening its broker subscription on first
    /// use. Callers asking for the same channel share one relay while any of
    /// them still holds it.
    pub async fn relay(&self, channel: &str) -> Result<Arc<Relay>, PublishError> {
        let mut relays = self.relays.lock().await;
        if let Some(existing) = relays.get(channel).and_then(Weak::upgrade) {
            if existing.is_active() {
                return Ok(existing);
            }
        }

        let stream = self.broker.subscribe(channel).await?;
        let links: Arc<Mutex<Links>> = Arc::new(Mutex::new(Links::default()));

        let fan_links = Arc::clone(&links);
        let fan_channel = channel.to_string();
        let end_links = Arc::clone(&links);
        let end_channel = channel.to_string();

        let subscription = Subscription::spawn(
            channel,
            stream,
            move |message| fan_out(&fan_channel, &fan_links, message),
            move || {
                // Dropping the senders ends every transport's outbound queue.
                let mut links = end_links.lock().expect("Relay lock poisoned");
                links.closed = true;
                let dropped = std::mem::take(&mut links.handles);
                drop(links);
                log::warn!(
                    "Broker stream for relay '{}' ended. Released {} transport(s).",
                    end_channel,
                    dropped.len()
                );
            },
        );

        let relay = Arc::new(Relay {
            channel: channel.to_string(),
            broker: Arc::clone(&self.broker),
            links,
            next_key: AtomicU64::new(1),
            subscription,
        });
        relays.insert(channel.to_string(), Arc::downgrade(&relay));
        log::info!("Relay opened for channel '{}'", channel);
        Ok(relay)
    }
}

/// # Subscription
///
/// Handle to one broker subscription. Cancelled explicitly with `cancel` or
/// implicitly when dropped.
pub struct Subscription {
    channel: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn<F, E>(channel: &str, mut stream: MessageStream, mut on_message: F, on_end: E) -> Self
    where
        F: FnMut(Bytes) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let name = channel.to_string();

        let handle = tokio::spawn(async move {
            let mut delivered: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        log::debug!("Subscription to '{}' cancelled after {} message(s).", name, delivered);
                        return;
                    }
                    next = stream.next() => match next {
                        Some(message) => {
                            delivered += 1;
                            on_message(message);
                        }
                        None => break,
                    }
                }
            }
            on_end();
        });

        Self {
            channel: channel.to_string(),
            token,
            handle: Some(handle),
        }
    }

    /// The subscribed channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops further handler invocations.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// False once cancelled or once the broker stream has ended.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits until the subscription task has exited, either through `cancel`
    /// or because the broker stream ended.
    pub async fn closed(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct LinkHandle {
    key: u64,
    id: String,
    sender: mpsc::UnboundedSender<Bytes>,
}

/// Transports of one relay. `closed` is set once the broker stream has ended;
/// no link is added after that.
#[derive(Default)]
struct Links {
    closed: bool,
    handles: Vec<LinkHandle>,
}

fn fan_out(channel: &str, links: &Mutex<Links>, message: Bytes) {
    let mut links = links.lock().expect("Relay lock poisoned");
    links.handles.retain(|link| match link.sender.send(message.clone()) {
        Ok(()) => true,
        Err(_) => {
            log::info!("Transport '{}' gone from relay '{}'. Removing.", link.id, channel);
            false
        }
    });
}

/// # Relay
///
/// One broker subscription shared by many local transports.
pub struct Relay {
    channel: String,
    broker: Arc<dyn Broker>,
    links: Arc<Mutex<Links>>,
    next_key: AtomicU64,
    subscription: Subscription,
}

impl Relay {
    /// The relayed channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the shared broker subscription is still running.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Number of connected transports.
    pub fn transport_count(&self) -> usize {
        self.links.lock().expect("Relay lock poisoned").handles.len()
    }

    /// Connects a transport. `id` is only used in logs. On a relay whose
    /// broker stream already ended the link comes back closed.
    pub fn connect(self: &Arc<Self>, id: impl Into<String>) -> TransportLink {
        let id = id.into();
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut links = self.links.lock().expect("Relay lock poisoned");
        if links.closed {
            log::warn!("Transport '{}' refused: relay '{}' is closed", id, self.channel);
            drop(tx);
        } else {
            links.handles.push(LinkHandle {
                key,
                id: id.clone(),
                sender: tx,
            });
            log::info!("Transport '{}' joined relay '{}' ({} connected)", id, self.channel, links.handles.len());
        }
        drop(links);

        TransportLink {
            id,
            key,
            relay: Arc::clone(self),
            outbound: rx,
        }
    }

    /// Republishes bytes received from a local transport, verbatim. A failure
    /// is returned to the caller and leaves the relay running.
    pub async fn inbound(&self, message: Bytes) -> Result<(), PublishError> {
        self.broker.publish(&self.channel, message).await
    }

    fn disconnect(&self, key: u64) {
        let mut links = self.links.lock().expect("Relay lock poisoned");
        if let Some(pos) = links.handles.iter().position(|link| link.key == key) {
            let link = links.handles.remove(pos);
            log::info!(
                "Transport '{}' left relay '{}' ({} connected)",
                link.id,
                self.channel,
                links.handles.len()
            );
        }
    }
}

/// # Transport Link
///
/// One local transport's attachment to a relay. Dropping it removes the
/// transport from the relay and nothing else.
pub struct TransportLink {
    id: String,
    key: u64,
    relay: Arc<Relay>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl TransportLink {
    /// The transport identifier given to `connect`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends bytes from this transport to the broker channel.
    pub async fn send(&self, message: Bytes) -> Result<(), PublishError> {
        self.relay.inbound(message).await
    }

    /// Next broker message for this transport. `None` once the relay's broker
    /// stream has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.relay.disconnect(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryBroker;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn bridge() -> (ChannelBridge, MemoryBroker) {
        let broker = MemoryBroker::new();
        (ChannelBridge::new(Arc::new(broker.clone())), broker)
    }

    #[tokio::test]
    async fn test_single_subscriber_gets_exact_payload_once() {
        let (bridge, _broker) = bridge();
        let (_subscription, mut rx) = bridge.subscribe_stream("redis/bitcoin").await.unwrap();

        let payload = Payload::from(r#"{"bpi":{"USD":{"rate_float":50000}}}"#);
        bridge.publish("redis/bitcoin", &payload).await.unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.as_ref(), payload.as_bytes());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_publish_order() {
        let (bridge, _broker) = bridge();
        let (_subscription, mut rx) = bridge.subscribe_stream("c").await.unwrap();

        for i in 0..50 {
            bridge.publish("c", &Payload::from(format!("{}", i))).await.unwrap();
        }
        for i in 0..50 {
            let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(message, format!("{}", i).as_str());
        }
    }

    #[tokio::test]
    async fn test_cancel_only_affects_own_subscription() {
        let (bridge, _broker) = bridge();
        let (cancelled, mut cancelled_rx) = bridge.subscribe_stream("c").await.unwrap();
        let (_kept, mut kept_rx) = bridge.subscribe_stream("c").await.unwrap();

        cancelled.cancel();
        cancelled.closed().await;

        bridge.publish("c", &Payload::from("after")).await.unwrap();
        assert_eq!(timeout(WAIT, kept_rx.recv()).await.unwrap().unwrap(), "after");
        assert!(timeout(WAIT, cancelled_rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callback_subscription_runs_handler() {
        let (bridge, _broker) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = bridge
            .subscribe("c", move |m| sink.lock().unwrap().push(m))
            .await
            .unwrap();

        bridge.publish("c", &Payload::from("x")).await.unwrap();
        timeout(WAIT, async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(subscription.is_active());
        assert_eq!(seen.lock().unwrap().as_slice(), &[Bytes::from_static(b"x")]);
    }

    #[tokio::test]
    async fn test_relay_shares_one_broker_subscription() {
        let (bridge, broker) = bridge();
        let first = bridge.relay("app:notifications").await.unwrap();
        let second = bridge.relay("app:notifications").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.subscriber_count("app:notifications"), 1);
    }

    #[tokio::test]
    async fn test_relay_inbound_reaches_every_transport() {
        let (bridge, _broker) = bridge();
        let relay = bridge.relay("app:notifications").await.unwrap();
        let mut a = relay.connect("a");
        let mut b = relay.connect("b");

        a.send(Bytes::from_static(br#"{"hello":"world"}"#)).await.unwrap();

        assert_eq!(timeout(WAIT, a.recv()).await.unwrap().unwrap(), r#"{"hello":"world"}"#);
        assert_eq!(timeout(WAIT, b.recv()).await.unwrap().unwrap(), r#"{"hello":"world"}"#);
    }

    #[tokio::test]
    async fn test_transport_disconnect_leaves_others_running() {
        let (bridge, broker) = bridge();
        let relay = bridge.relay("c").await.unwrap();
        let mut stay = relay.connect("stay");
        let leave = relay.connect("leave");
        assert_eq!(relay.transport_count(), 2);

        drop(leave);
        assert_eq!(relay.transport_count(), 1);

        bridge.publish("c", &Payload::from("still here")).await.unwrap();
        assert_eq!(timeout(WAIT, stay.recv()).await.unwrap().unwrap(), "still here");
        assert!(relay.is_active());
        assert_eq!(broker.subscriber_count("c"), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_close_relay() {
        let (bridge, broker) = bridge();
        let relay = bridge.relay("c").await.unwrap();
        let mut link = relay.connect("client");

        broker.set_unreachable(true);
        let err = link.send(Bytes::from_static(b"lost")).await.unwrap_err();
        assert!(matches!(err, PublishError::Unreachable(_)));
        assert!(relay.is_active());

        broker.set_unreachable(false);
        link.send(Bytes::from_static(b"delivered")).await.unwrap();
        assert_eq!(timeout(WAIT, link.recv()).await.unwrap().unwrap(), "delivered");
    }

    #[tokio::test]
    async fn test_broker_loss_ends_transport_queues() {
        let (bridge, broker) = bridge();
        let relay = bridge.relay("c").await.unwrap();
        let mut link = relay.connect("client");

        broker.shutdown();
        assert!(timeout(WAIT, link.recv()).await.unwrap().is_none());
        assert_eq!(relay.transport_count(), 0);

        // A fresh relay is opened for the next caller.
        let reopened = bridge.relay("c").await.unwrap();
        assert!(!Arc::ptr_eq(&relay, &reopened));
    }

    #[tokio::test]
    async fn test_connect_after_broker_loss_returns_closed_link() {
        let (bridge, broker) = bridge();
        let relay = bridge.relay("c").await.unwrap();
        let mut first = relay.connect("first");

        broker.shutdown();
        assert!(timeout(WAIT, first.recv()).await.unwrap().is_none());

        // Holding the old relay past the loss must not hand out a link that waits forever.
        let mut late = relay.connect("late");
        assert!(timeout(WAIT, late.recv()).await.unwrap().is_none());
        assert_eq!(relay.transport_count(), 0);
    }
}
