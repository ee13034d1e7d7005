//! # Dual-Tier Fan-out Coordinator
//!
//! Takes every message the channel bridge relays and delivers it twice over:
//! once to each registered local consumer, and once, if a secondary-tier
//! session is attached, to a configured topic on that tier. Echoes coming back
//! from the tier are delivered to the same consumers, tagged
//! `Origin::Secondary`.
//!
//! ## Core Design Principles:
//!
//! 1.  **Snapshot Dispatch**: The consumer list is copy-on-write. A dispatch
//!     clones an `Arc` to the current list and walks that, so a concurrent
//!     `register_consumer` or `unregister_consumer` never makes an in-flight
//!     dispatch skip or repeat anyone.
//!
//! 2.  **Consumer Isolation**: Each consumer runs inside `catch_unwind`. An
//!     error or a panic is logged and counted, then delivery moves on to the
//!     next consumer. Consumers are synchronous; slow work belongs behind a
//!     [`ChannelConsumer`](crate::core::consumers::ChannelConsumer).
//!
//! 3.  **Drop on Disconnect**: With no session attached the secondary publish
//!     is skipped without error and nothing is queued.
//!
//! 4.  **Single Attachment**: The tier slot moves
//!     `Detached → Connecting → Attached`. A second attach during `Connecting`
//!     is refused with `Busy`. Every attach gets an epoch number; an attach
//!     whose epoch no longer matches the slot when it finishes (because a
//!     detach happened meanwhile) is rolled back.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bridge::ChannelBridge;
use crate::core::payload::{Delivery, Payload};
use crate::errors::{AttachError, ConsumerError, TierError, TopicError};
use crate::secondary::{Credentials, TierConnector, TierSession, TopicSpec, TopicStream, TopicUpdate, ValueType};

/// # Consumer
///
/// A local sink for relayed payloads. Closures of the right shape are
/// consumers too.
pub trait Consumer: Send + Sync {
    /// Handles one delivery.
    fn deliver(&self, delivery: &Delivery) -> Result<(), ConsumerError>;
}

impl<F> Consumer for F
where
    F: Fn(&Delivery) -> Result<(), ConsumerError> + Send + Sync,
{
    fn deliver(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        self(delivery)
    }
}

/// Pins a closure to the consumer signature so its argument and return types
/// are inferred.
pub fn consumer_fn<F>(f: F) -> F
where
    F: Fn(&Delivery) -> Result<(), ConsumerError> + Send + Sync,
{
    f
}

struct Registration {
    id: String,
    consumer: Arc<dyn Consumer>,
}

/// What one dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Consumers that accepted the delivery.
    pub delivered: usize,
    /// Ids of consumers that returned an error or panicked.
    pub failed: Vec<String>,
    /// Whether the payload was published to the secondary tier.
    pub forwarded: bool,
}

/// Public view of the tier slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// No session.
    Detached,
    /// An attach is in progress.
    Connecting,
    /// A session is active.
    Attached,
}

/// Coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Primary-origin messages dispatched.
    pub relayed: u64,
    /// Secondary-origin echoes dispatched.
    pub echoed: u64,
    /// Consumer failures (errors and panics).
    pub consumer_failures: u64,
    /// Successful secondary-tier publishes.
    pub forwarded: u64,
    /// Failed secondary-tier publishes.
    pub forward_failures: u64,
}

#[derive(Default)]
struct Counters {
    relayed: AtomicU64,
    echoed: AtomicU64,
    consumer_failures: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
}

struct AttachedTier {
    epoch: u64,
    endpoint: String,
    session: Arc<dyn TierSession>,
    /// Stops the echo task.
    echo: CancellationToken,
}

impl AttachedTier {
    async fn shutdown(self) {
        self.echo.cancel();
        self.session.close().await;
    }
}

enum TierSlot {
    Detached,
    Connecting { epoch: u64 },
    Attached(AttachedTier),
}

/// # Fan-out Coordinator
///
/// Owns the secondary-tier session, if any. Share it as an `Arc`.
pub struct FanoutCoordinator {
    topic: String,
    value_type: ValueType,
    consumers: RwLock<Arc<Vec<Registration>>>,
    slot: Mutex<TierSlot>,
    next_epoch: AtomicU64,
    /// `endpoint|topic` pairs this coordinator has already provisioned.
    provisioned: Mutex<HashSet<String>>,
    counters: Counters,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

impl FanoutCoordinator {
    /// A coordinator that republishes to `topic` as JSON.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            value_type: ValueType::Json,
            consumers: RwLock::new(Arc::new(Vec::new())),
            slot: Mutex::new(TierSlot::Detached),
            next_epoch: AtomicU64::new(0),
            provisioned: Mutex::new(HashSet::new()),
            counters: Counters::default(),
        }
    }

    /// Sets the value type the topic is provisioned with.
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// The configured secondary-tier topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    // --- Consumers ---

    /// # Register Consumer
    ///
    /// Appends a consumer. Re-registering an existing id replaces its callback
    /// and keeps its position in the delivery order.
    pub fn register_consumer(&self, id: impl Into<String>, consumer: impl Consumer + 'static) {
        self.register_shared(id, Arc::new(consumer));
    }

    /// Like [`register_consumer`](Self::register_consumer) for an already shared
    /// consumer.
    pub fn register_shared(&self, id: impl Into<String>, consumer: Arc<dyn Consumer>) {
        let id = id.into();
        let mut guard = self.consumers.write().expect("Consumer list lock poisoned");
        let mut next: Vec<Registration> = guard
            .iter()
            .map(|r| Registration {
                id: r.id.clone(),
                consumer: Arc::clone(&r.consumer),
            })
            .collect();

        match next.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                existing.consumer = consumer;
                log::info!("Consumer '{}' replaced", id);
            }
            None => {
                log::info!("Consumer '{}' registered ({} total)", id, next.len() + 1);
                next.push(Registration { id, consumer });
            }
        }
        *guard = Arc::new(next);
    }

    /// Removes a consumer. Returns whether it was registered.
    pub fn unregister_consumer(&self, id: &str) -> bool {
        let mut guard = self.consumers.write().expect("Consumer list lock poisoned");
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<Registration> = guard
            .iter()
            .filter(|r| r.id != id)
            .map(|r| Registration {
                id: r.id.clone(),
                consumer: Arc::clone(&r.consumer),
            })
            .collect();
        *guard = Arc::new(next);
        log::info!("Consumer '{}' unregistered", id);
        true
    }

    /// Registered ids in delivery order.
    pub fn consumer_ids(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.id.clone()).collect()
    }

    fn snapshot(&self) -> Arc<Vec<Registration>> {
        Arc::clone(&self.consumers.read().expect("Consumer list lock poisoned"))
    }

    fn dispatch(&self, delivery: &Delivery) -> DispatchReport {
        let consumers = self.snapshot();
        let mut report = DispatchReport::default();

        for registration in consumers.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.consumer.deliver(delivery)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    log::warn!("Consumer '{}' failed: {}", registration.id, e);
                    report.failed.push(registration.id.clone());
                }
                Err(panic) => {
                    log::error!("Consumer '{}' panicked: {}", registration.id, panic_message(panic.as_ref()));
                    report.failed.push(registration.id.clone());
                }
            }
        }

        self.counters
            .consumer_failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        report
    }

    // --- Message paths ---

    /// # On Bridge Message
    ///
    /// Entry point for every primary-tier message.
    ///
    /// ## Logic:
    /// 1.  Dispatch to local consumers in registration order.
    /// 2.  If a session is attached, publish the same bytes to the topic. A
    ///     topic the tier no longer knows is provisioned again and the publish
    ///     retried once. A publish that reports a lost session detaches the
    ///     tier; any other failure is logged and the session stays.
    pub async fn on_bridge_message(&self, payload: Payload) -> DispatchReport {
        let delivery = Delivery::primary(payload);
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
        let mut report = self.dispatch(&delivery);

        let target = match &*self.slot.lock().expect("Tier slot lock poisoned") {
            TierSlot::Attached(attached) => Some((
                attached.epoch,
                attached.endpoint.clone(),
                Arc::clone(&attached.session),
            )),
            _ => None,
        };
        let Some((epoch, endpoint, session)) = target else {
            return report;
        };

        let outcome = match session.publish(&self.topic, &delivery.payload).await {
            Err(TierError::NoSuchTopic(_)) => self.republish(session.as_ref(), &endpoint, &delivery.payload).await,
            other => other,
        };
        match outcome {
            Ok(()) => {
                report.forwarded = true;
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TierError::Disconnected) => {
                self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                self.mark_lost(epoch).await;
            }
            Err(e) => {
                self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Secondary publish to '{}' failed: {}", self.topic, e);
            }
        }
        report
    }

    /// Provisions the topic again on a session whose tier lost it, then
    /// retries the publish.
    async fn republish(&self, session: &dyn TierSession, endpoint: &str, payload: &Payload) -> Result<(), TierError> {
        let key = self.provision_key(endpoint);
        self.provisioned.lock().expect("Provisioned set lock poisoned").remove(&key);
        log::warn!("Topic '{}' missing on {}; provisioning again", self.topic, endpoint);

        match session.ensure_topic(&self.topic, TopicSpec::new(self.value_type)).await {
            Ok(()) => {
                self.provisioned.lock().expect("Provisioned set lock poisoned").insert(key);
            }
            Err(TopicError::Disconnected) => return Err(TierError::Disconnected),
            Err(e) => return Err(TierError::Protocol(e.to_string())),
        }
        session.publish(&self.topic, payload).await
    }

    fn provision_key(&self, endpoint: &str) -> String {
        format!("{}|{}", endpoint, self.topic)
    }

    /// Entry point for echoes from the secondary tier.
    pub fn on_secondary_message(&self, update: TopicUpdate) -> DispatchReport {
        self.counters.echoed.fetch_add(1, Ordering::Relaxed);
        self.dispatch(&Delivery::secondary(update.new_value, update.path))
    }

    /// Feeds raw broker messages (e.g. from `ChannelBridge::subscribe_stream`)
    /// through [`on_bridge_message`](Self::on_bridge_message), in order, until
    /// the queue closes.
    pub async fn pump(&self, mut messages: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(message) = messages.recv().await {
            self.on_bridge_message(Payload::from(message)).await;
        }
        log::info!("Fan-out pump for '{}' finished", self.topic);
    }

    /// # Follow Channel
    ///
    /// Subscribes to `channel` and pumps it until `stop` is cancelled. When the
    /// broker stream ends or a subscribe fails, waits `retry` and subscribes
    /// again. On stop the subscription is cancelled and whatever is already
    /// queued is still delivered.
    pub async fn follow_channel(&self, bridge: &ChannelBridge, channel: &str, retry: Duration, stop: CancellationToken) {
        loop {
            match bridge.subscribe_stream(channel).await {
                Ok((subscription, messages)) => {
                    log::info!("Following channel '{}' into '{}'", channel, self.topic);
                    let pump = self.pump(messages);
                    tokio::pin!(pump);
                    tokio::select! {
                        _ = &mut pump => {
                            log::warn!("Subscription to '{}' lost. Resubscribing in {:?}.", channel, retry);
                        }
                        _ = stop.cancelled() => {
                            subscription.cancel();
                            pump.await;
                            return;
                        }
                    }
                }
                Err(e) => log::error!("Subscribe to '{}' failed: {}. Retrying in {:?}.", channel, e, retry),
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    // --- Secondary tier ---

    /// Current attachment state.
    pub fn attachment_state(&self) -> AttachmentState {
        match &*self.slot.lock().expect("Tier slot lock poisoned") {
            TierSlot::Detached => AttachmentState::Detached,
            TierSlot::Connecting { .. } => AttachmentState::Connecting,
            TierSlot::Attached(_) => AttachmentState::Attached,
        }
    }

    /// # Attach Secondary Tier
    ///
    /// Connects, provisions the topic once per tier endpoint, subscribes to it
    /// for echoes, and makes the session active. Any previous session is
    /// closed first. On failure the slot returns to `Detached` and the primary
    /// path keeps running.
    pub async fn attach_secondary_tier(
        self: &Arc<Self>,
        connector: &dyn TierConnector,
        credentials: &Credentials,
    ) -> Result<(), AttachError> {
        let (epoch, previous) = {
            let mut slot = self.slot.lock().expect("Tier slot lock poisoned");
            if matches!(*slot, TierSlot::Connecting { .. }) {
                return Err(AttachError::Busy);
            }
            let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            (epoch, std::mem::replace(&mut *slot, TierSlot::Connecting { epoch }))
        };

        if let TierSlot::Attached(previous) = previous {
            log::info!("Replacing tier session {}", previous.session.session_id());
            previous.shutdown().await;
        }

        log::info!("Attaching secondary tier at {} as '{}'", credentials.endpoint(), credentials.principal);
        let attached = match self.establish(epoch, connector, credentials).await {
            Ok(attached) => attached,
            Err(e) => {
                let mut slot = self.slot.lock().expect("Tier slot lock poisoned");
                if matches!(*slot, TierSlot::Connecting { epoch: current } if current == epoch) {
                    *slot = TierSlot::Detached;
                }
                log::warn!("Secondary tier attach failed: {}", e);
                return Err(e);
            }
        };

        let rejected = {
            let mut slot = self.slot.lock().expect("Tier slot lock poisoned");
            if matches!(*slot, TierSlot::Connecting { epoch: current } if current == epoch) {
                log::info!(
                    "Secondary tier attached: session {} on {}",
                    attached.session.session_id(),
                    attached.endpoint
                );
                *slot = TierSlot::Attached(attached);
                None
            } else {
                Some(attached)
            }
        };

        match rejected {
            None => Ok(()),
            Some(attached) => {
                log::info!("Attach of session {} superseded; closing it", attached.session.session_id());
                attached.shutdown().await;
                Err(AttachError::Cancelled)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        connector: &dyn TierConnector,
        credentials: &Credentials,
    ) -> Result<AttachedTier, AttachError> {
        let session = connector.connect(credentials).await?;
        let endpoint = credentials.endpoint();
        let key = self.provision_key(&endpoint);

        let already = self.provisioned.lock().expect("Provisioned set lock poisoned").contains(&key);
        if !already {
            if let Err(e) = session.ensure_topic(&self.topic, TopicSpec::new(self.value_type)).await {
                session.close().await;
                return Err(e.into());
            }
            self.provisioned.lock().expect("Provisioned set lock poisoned").insert(key);
            log::info!("Topic '{}' provisioned on {}", self.topic, endpoint);
        }

        let updates = match session.subscribe(&self.topic).await {
            Ok(updates) => updates,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let echo = CancellationToken::new();
        tokio::spawn(echo_loop(Arc::downgrade(self), updates, echo.clone(), epoch));

        Ok(AttachedTier {
            epoch,
            endpoint,
            session,
            echo,
        })
    }

    /// # Detach Secondary Tier
    ///
    /// Closes the active session, or cancels an attach still in progress.
    /// Returns `false` if already detached.
    pub async fn detach_secondary_tier(&self) -> bool {
        let previous = std::mem::replace(&mut *self.slot.lock().expect("Tier slot lock poisoned"), TierSlot::Detached);
        match previous {
            TierSlot::Detached => false,
            TierSlot::Connecting { epoch } => {
                log::info!("Pending attach {} cancelled by detach", epoch);
                true
            }
            TierSlot::Attached(attached) => {
                log::info!("Detaching tier session {}", attached.session.session_id());
                attached.shutdown().await;
                true
            }
        }
    }

    /// Detaches after a connection loss, if `epoch` is still the active one.
    /// The endpoint's topic is provisioned again on the next attach, since the
    /// tier behind it may have restarted.
    async fn mark_lost(&self, epoch: u64) {
        let lost = {
            let mut slot = self.slot.lock().expect("Tier slot lock poisoned");
            match &*slot {
                TierSlot::Attached(attached) if attached.epoch == epoch => {
                    match std::mem::replace(&mut *slot, TierSlot::Detached) {
                        TierSlot::Attached(attached) => Some(attached),
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        if let Some(attached) = lost {
            self.provisioned
                .lock()
                .expect("Provisioned set lock poisoned")
                .remove(&self.provision_key(&attached.endpoint));
            log::warn!("Secondary tier session {} lost; detached", attached.session.session_id());
            attached.shutdown().await;
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            echoed: self.counters.echoed.load(Ordering::Relaxed),
            consumer_failures: self.counters.consumer_failures.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            forward_failures: self.counters.forward_failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes tier echoes to the coordinator until cancelled, or until the stream
/// ends, which means the session was lost.
async fn echo_loop(
    coordinator: Weak<FanoutCoordinator>,
    mut updates: TopicStream,
    token: CancellationToken,
    epoch: u64,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            update = updates.recv() => update,
        };
        let Some(strong) = coordinator.upgrade() else { return };
        match update {
            Some(update) => {
                strong.on_secondary_message(update);
            }
            None => {
                strong.mark_lost(epoch).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::Origin;
    use crate::errors::ConnectError;
    use crate::secondary::MemoryTier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::time::timeout;

    fn creds() -> Credentials {
        Credentials {
            host: "127.0.0.1".into(),
            principal: "admin".into(),
            credential: "password".into(),
            port: 443,
            secure: true,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Delivery>>>, impl Consumer + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            seen,
            consumer_fn(move |d| {
                sink.lock().unwrap().push(d.clone());
                Ok(())
            }),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_detached_tier_is_silently_skipped() {
        let coordinator = FanoutCoordinator::new("redis/bitcoin");
        let (seen, consumer) = recorder();
        coordinator.register_consumer("chart", consumer);

        let report = coordinator.on_bridge_message(Payload::from(r#"{"v":1}"#)).await;
        assert_eq!(report.delivered, 1);
        assert!(report.failed.is_empty());
        assert!(!report.forwarded);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload.as_bytes(), br#"{"v":1}"#);
        assert_eq!(seen[0].origin, Origin::Primary);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_consumers_are_isolated() {
        let coordinator = FanoutCoordinator::new("t");
        coordinator.register_consumer("errs", consumer_fn(|_| Err(ConsumerError::new("boom"))));
        coordinator.register_consumer("panics", consumer_fn(|_| panic!("consumer bug")));
        let (seen, consumer) = recorder();
        coordinator.register_consumer("last", consumer);

        let report = coordinator.on_bridge_message(Payload::from("1")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec!["errs".to_string(), "panics".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(coordinator.stats().consumer_failures, 2);
    }

    #[tokio::test]
    async fn test_delivery_follows_registration_order_and_replacement() {
        let coordinator = FanoutCoordinator::new("t");
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            coordinator.register_consumer(
                id,
                consumer_fn(move |_| {
                    order.lock().unwrap().push(id.to_string());
                    Ok(())
                }),
            );
        }
        let replaced = Arc::clone(&order);
        coordinator.register_consumer(
            "b",
            consumer_fn(move |_| {
                replaced.lock().unwrap().push("b2".to_string());
                Ok(())
            }),
        );

        coordinator.on_bridge_message(Payload::from("1")).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b2", "c"]);
        assert_eq!(coordinator.consumer_ids(), vec!["a", "b", "c"]);
        assert!(coordinator.unregister_consumer("b"));
        assert!(!coordinator.unregister_consumer("b"));
    }

    #[tokio::test]
    async fn test_unregister_during_dispatch_uses_snapshot() {
        let coordinator = Arc::new(FanoutCoordinator::new("t"));
        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());

        // The first consumer removes the other two mid-dispatch.
        let weak = Arc::downgrade(&coordinator);
        let first_counts = Arc::clone(&counts);
        coordinator.register_consumer(
            "remover",
            consumer_fn(move |_| {
                first_counts[0].fetch_add(1, Ordering::SeqCst);
                if let Some(c) = weak.upgrade() {
                    c.unregister_consumer("second");
                    c.unregister_consumer("third");
                }
                Ok(())
            }),
        );
        for (index, id) in [(1usize, "second"), (2usize, "third")] {
            let counts = Arc::clone(&counts);
            coordinator.register_consumer(
                id,
                consumer_fn(move |_| {
                    counts[index].fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let report = coordinator.on_bridge_message(Payload::from("1")).await;
        assert_eq!(report.delivered, 3);
        for count in counts.iter() {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        coordinator.on_bridge_message(Payload::from("2")).await;
        assert_eq!(counts[0].load(Ordering::SeqCst), 2);
        assert_eq!(counts[1].load(Ordering::SeqCst), 1);
        assert_eq!(counts[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attached_tier_receives_publish_and_echo() {
        let tier = MemoryTier::new();
        let coordinator = Arc::new(FanoutCoordinator::new("redis/bitcoin"));
        let (seen, consumer) = recorder();
        coordinator.register_consumer("chart", consumer);

        coordinator.attach_secondary_tier(&tier, &creds()).await.unwrap();
        assert_eq!(coordinator.attachment_state(), AttachmentState::Attached);

        let payload = Payload::from(r#"{"bpi":{"USD":{"rate_float":50000}}}"#);
        let report = coordinator.on_bridge_message(payload.clone()).await;
        assert!(report.forwarded);
        assert_eq!(tier.topic_value("redis/bitcoin"), Some(payload.clone()));

        eventually(|| seen.lock().unwrap().len() == 2).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].origin, Origin::Primary);
        assert_eq!(seen[1].origin, Origin::Secondary);
        assert_eq!(seen[1].topic.as_deref(), Some("redis/bitcoin"));
        assert_eq!(seen[1].payload, payload);
    }

    /// Wraps a tier and counts `ensure_topic` calls per connection.
    struct CountingConnector {
        tier: MemoryTier,
        ensures: Arc<AtomicUsize>,
        /// When set, the next publish reports the topic as missing.
        forget_topic: Arc<AtomicBool>,
    }

    struct CountingSession {
        inner: Arc<dyn TierSession>,
        ensures: Arc<AtomicUsize>,
        forget_topic: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TierConnector for CountingConnector {
        async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TierSession>, ConnectError> {
            let inner = self.tier.connect(credentials).await?;
            Ok(Arc::new(CountingSession {
                inner,
                ensures: Arc::clone(&self.ensures),
                forget_topic: Arc::clone(&self.forget_topic),
            }))
        }
    }

    #[async_trait]
    impl TierSession for CountingSession {
        fn session_id(&self) -> &str {
            self.inner.session_id()
        }
        async fn ensure_topic(&self, path: &str, spec: TopicSpec) -> Result<(), crate::errors::TopicError> {
            self.ensures.fetch_add(1, Ordering::SeqCst);
            self.inner.ensure_topic(path, spec).await
        }
        async fn publish(&self, path: &str, value: &Payload) -> Result<(), TierError> {
            if self.forget_topic.swap(false, Ordering::SeqCst) {
                return Err(TierError::NoSuchTopic(path.to_string()));
            }
            self.inner.publish(path, value).await
        }
        async fn subscribe(&self, path: &str) -> Result<TopicStream, TierError> {
            self.inner.subscribe(path).await
        }
        async fn create_topic_view(&self, name: &str, spec: &str) -> Result<(), crate::errors::TopicError> {
            self.inner.create_topic_view(name, spec).await
        }
        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_double_attach_provisions_topic_once() {
        let tier = MemoryTier::new();
        let ensures = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            tier: tier.clone(),
            ensures: Arc::clone(&ensures),
            forget_topic: Arc::new(AtomicBool::new(false)),
        };
        let coordinator = Arc::new(FanoutCoordinator::new("redis/bitcoin"));

        coordinator.attach_secondary_tier(&connector, &creds()).await.unwrap();
        coordinator.attach_secondary_tier(&connector, &creds()).await.unwrap();

        assert_eq!(ensures.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.attachment_state(), AttachmentState::Attached);
        // The first session was replaced, not merged.
        assert_eq!(tier.session_count(), 1);
    }

    #[tokio::test]
    async fn test_reattach_after_loss_provisions_restarted_tier() {
        let first = MemoryTier::new();
        let coordinator = Arc::new(FanoutCoordinator::new("redis/bitcoin"));
        coordinator.attach_secondary_tier(&first, &creds()).await.unwrap();

        first.sever();
        eventually(|| coordinator.attachment_state() == AttachmentState::Detached).await;

        // Same endpoint, fresh topic tree.
        let restarted = MemoryTier::new();
        coordinator.attach_secondary_tier(&restarted, &creds()).await.unwrap();
        assert_eq!(restarted.ensure_count(), 1);

        let payload = Payload::from(r#"{"v":2}"#);
        let report = coordinator.on_bridge_message(payload.clone()).await;
        assert!(report.forwarded);
        assert_eq!(restarted.topic_value("redis/bitcoin"), Some(payload));
        assert_eq!(coordinator.stats().forward_failures, 0);
    }

    #[tokio::test]
    async fn test_missing_topic_on_publish_is_provisioned_again() {
        let tier = MemoryTier::new();
        let ensures = Arc::new(AtomicUsize::new(0));
        let forget_topic = Arc::new(AtomicBool::new(false));
        let connector = CountingConnector {
            tier: tier.clone(),
            ensures: Arc::clone(&ensures),
            forget_topic: Arc::clone(&forget_topic),
        };
        let coordinator = Arc::new(FanoutCoordinator::new("redis/bitcoin"));
        coordinator.attach_secondary_tier(&connector, &creds()).await.unwrap();

        forget_topic.store(true, Ordering::SeqCst);
        let report = coordinator.on_bridge_message(Payload::from("7")).await;

        assert!(report.forwarded);
        assert_eq!(ensures.load(Ordering::SeqCst), 2);
        assert_eq!(tier.topic_value("redis/bitcoin"), Some(Payload::from("7")));
        assert_eq!(coordinator.attachment_state(), AttachmentState::Attached);
    }

    #[tokio::test]
    async fn test_detach_mid_stream_stops_tier_publishes() {
        let tier = MemoryTier::new();
        let coordinator = Arc::new(FanoutCoordinator::new("t"));
        let (seen, consumer) = recorder();
        coordinator.register_consumer("c", consumer);
        coordinator.attach_secondary_tier(&tier, &creds()).await.unwrap();

        for i in 0..3 {
            coordinator.on_bridge_message(Payload::from(format!("{}", i))).await;
        }
        assert_eq!(tier.publish_count(), 3);

        assert!(coordinator.detach_secondary_tier().await);
        assert!(!coordinator.detach_secondary_tier().await);

        for i in 3..6 {
            let report = coordinator.on_bridge_message(Payload::from(format!("{}", i))).await;
            assert!(report.failed.is_empty());
            assert!(!report.forwarded);
        }
        assert_eq!(tier.publish_count(), 3);
        assert_eq!(tier.session_count(), 0);
        let primary = seen.lock().unwrap().iter().filter(|d| d.origin == Origin::Primary).count();
        assert_eq!(primary, 6);
    }

    #[tokio::test]
    async fn test_rejected_login_leaves_tier_detached() {
        let tier = MemoryTier::new().with_login("admin", "secret");
        let coordinator = Arc::new(FanoutCoordinator::new("t"));

        let err = coordinator.attach_secondary_tier(&tier, &creds()).await.unwrap_err();
        assert!(matches!(err, AttachError::Connect(ConnectError::Rejected(_))));
        assert_eq!(coordinator.attachment_state(), AttachmentState::Detached);

        let report = coordinator.on_bridge_message(Payload::from("1")).await;
        assert!(!report.forwarded);
    }

    #[tokio::test]
    async fn test_type_conflict_aborts_attach_only() {
        let tier = MemoryTier::new();
        let setup = tier.open_session("x", "y").unwrap();
        setup
            .ensure_topic("t", TopicSpec::new(ValueType::String))
            .await
            .unwrap();

        let coordinator = Arc::new(FanoutCoordinator::new("t"));
        let err = coordinator.attach_secondary_tier(&tier, &creds()).await.unwrap_err();
        assert!(matches!(err, AttachError::Topic(_)));
        assert_eq!(coordinator.attachment_state(), AttachmentState::Detached);
        // Only the setup session remains open.
        assert_eq!(tier.session_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_detaches() {
        let tier = MemoryTier::new();
        let coordinator = Arc::new(FanoutCoordinator::new("t"));
        coordinator.attach_secondary_tier(&tier, &creds()).await.unwrap();

        tier.sever();
        eventually(|| coordinator.attachment_state() == AttachmentState::Detached).await;

        let report = coordinator.on_bridge_message(Payload::from("1")).await;
        assert!(!report.forwarded);
    }

    /// Connector that parks until released, to observe `Connecting`.
    struct GatedConnector {
        tier: MemoryTier,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl TierConnector for GatedConnector {
        async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TierSession>, ConnectError> {
            self.gate.notified().await;
            self.tier.connect(credentials).await
        }
    }

    #[tokio::test]
    async fn test_attach_while_connecting_is_busy_and_detach_cancels() {
        let tier = MemoryTier::new();
        let connector = Arc::new(GatedConnector {
            tier: tier.clone(),
            gate: tokio::sync::Notify::new(),
        });
        let coordinator = Arc::new(FanoutCoordinator::new("t"));

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { coordinator.attach_secondary_tier(connector.as_ref(), &creds()).await })
        };
        eventually(|| coordinator.attachment_state() == AttachmentState::Connecting).await;

        let busy = coordinator.attach_secondary_tier(connector.as_ref(), &creds()).await;
        assert!(matches!(busy, Err(AttachError::Busy)));

        assert!(coordinator.detach_secondary_tier().await);
        connector.gate.notify_one();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(AttachError::Cancelled)));
        assert_eq!(coordinator.attachment_state(), AttachmentState::Detached);
        assert_eq!(tier.session_count(), 0);
    }

    #[tokio::test]
    async fn test_pump_relays_in_order() {
        let coordinator = FanoutCoordinator::new("t");
        let (seen, consumer) = recorder();
        coordinator.register_consumer("c", consumer);

        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(Bytes::from(format!("{}", i))).unwrap();
        }
        drop(tx);
        coordinator.pump(rx).await;

        let seen: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.payload.as_str().unwrap().to_string())
            .collect();
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(coordinator.stats().relayed, 5);
    }
}
