//! # In-Process Topic Tier
//!
//! Holds the whole topic tree behind one mutex. Sessions are lightweight
//! handles onto the shared tree; closing a session (or severing the tier) ends
//! its subscription streams and makes its further calls fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::payload::Payload;
use crate::errors::{ConnectError, TierError, TopicError};
use crate::secondary::{
    validate_path, Credentials, TierConnector, TierSession, TopicSpec, TopicStream, TopicUpdate, TopicView,
};

struct TopicEntry {
    spec: TopicSpec,
    value: Option<Payload>,
}

struct Watcher {
    session: u64,
    sender: mpsc::UnboundedSender<TopicUpdate>,
}

#[derive(Default)]
struct TopicTree {
    topics: HashMap<String, TopicEntry>,
    watchers: HashMap<String, Vec<Watcher>>,
    views: Vec<TopicView>,
    live_sessions: HashSet<u64>,
    next_session: u64,
}

impl TopicTree {
    fn ensure(&mut self, path: &str, spec: TopicSpec) -> Result<bool, TopicError> {
        if let Some(existing) = self.topics.get(path) {
            if existing.spec.value_type != spec.value_type {
                return Err(TopicError::TypeConflict {
                    path: path.to_string(),
                    existing: existing.spec.value_type,
                    requested: spec.value_type,
                });
            }
            return Ok(false);
        }
        self.topics.insert(path.to_string(), TopicEntry { spec, value: None });
        Ok(true)
    }

    /// Sets a value and cascades it through any views sourced from `path`.
    /// `from_view` is the only way to write a read-only topic.
    fn write(&mut self, path: &str, value: Payload, from_view: bool) -> Result<(), TierError> {
        let entry = self
            .topics
            .get_mut(path)
            .ok_or_else(|| TierError::NoSuchTopic(path.to_string()))?;
        if entry.spec.read_only && !from_view {
            return Err(TierError::ReadOnly(path.to_string()));
        }
        if !entry.spec.value_type.accepts(&value) {
            return Err(TierError::InvalidValue {
                path: path.to_string(),
                reason: format!("not a valid {} value", entry.spec.value_type),
            });
        }

        let spec = entry.spec;
        let old_value = entry.value.replace(value.clone());
        self.notify(path, spec, &value, old_value);

        let derived: Vec<(String, Payload)> = self
            .views
            .iter()
            .filter(|view| view.source == path)
            .filter_map(|view| view.project(&value).map(|projected| (view.target.clone(), projected)))
            .collect();
        for (target, projected) in derived {
            if let Err(e) = self.write(&target, projected, true) {
                log::warn!("Topic view update of '{}' from '{}' failed: {}", target, path, e);
            }
        }
        Ok(())
    }

    fn notify(&mut self, path: &str, spec: TopicSpec, value: &Payload, old_value: Option<Payload>) {
        if let Some(list) = self.watchers.get_mut(path) {
            list.retain(|watcher| {
                watcher
                    .sender
                    .send(TopicUpdate {
                        path: path.to_string(),
                        spec,
                        new_value: value.clone(),
                        old_value: old_value.clone(),
                    })
                    .is_ok()
            });
        }
    }

    fn watch(&mut self, session: u64, path: &str) -> TopicStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(entry) = self.topics.get(path) {
            if let Some(current) = &entry.value {
                let _ = tx.send(TopicUpdate {
                    path: path.to_string(),
                    spec: entry.spec,
                    new_value: current.clone(),
                    old_value: None,
                });
            }
        }
        self.watchers
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session, sender: tx });
        rx
    }

    fn add_view(&mut self, view: TopicView) -> Result<(), TopicError> {
        if let Some(existing) = self.views.iter().find(|v| v.name == view.name) {
            return if *existing == view {
                Ok(())
            } else {
                Err(TopicError::InvalidView(format!(
                    "view '{}' already exists with a different definition",
                    view.name
                )))
            };
        }
        let source = self
            .topics
            .get(&view.source)
            .ok_or_else(|| TopicError::InvalidView(format!("source topic '{}' does not exist", view.source)))?;
        if self.topics.contains_key(&view.target) {
            return Err(TopicError::InvalidView(format!(
                "target topic '{}' already exists",
                view.target
            )));
        }

        let spec = TopicSpec {
            value_type: view.target_type(source.spec.value_type),
            read_only: true,
        };
        let initial = source.value.as_ref().and_then(|value| view.project(value));

        self.topics.insert(view.target.clone(), TopicEntry { spec, value: None });
        let target = view.target.clone();
        self.views.push(view);
        if let Some(value) = initial {
            if let Err(e) = self.write(&target, value, true) {
                log::warn!("Initial projection into '{}' failed: {}", target, e);
            }
        }
        Ok(())
    }

    fn drop_session(&mut self, session: u64) -> bool {
        let was_live = self.live_sessions.remove(&session);
        for list in self.watchers.values_mut() {
            list.retain(|watcher| watcher.session != session);
        }
        was_live
    }
}

#[derive(Default)]
struct TierCounters {
    publishes: AtomicU64,
    ensures: AtomicU64,
}

/// # Memory Tier
///
/// Clones share one topic tree.
#[derive(Clone, Default)]
pub struct MemoryTier {
    tree: Arc<Mutex<TopicTree>>,
    login: Option<Arc<(String, String)>>,
    counters: Arc<TierCounters>,
}

impl MemoryTier {
    /// A tier that accepts any principal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `principal` with `credential` may open sessions.
    pub fn with_login(mut self, principal: impl Into<String>, credential: impl Into<String>) -> Self {
        self.login = Some(Arc::new((principal.into(), credential.into())));
        self
    }

    /// Opens a session directly, without going through a connector.
    pub fn open_session(&self, principal: &str, credential: &str) -> Result<MemorySession, ConnectError> {
        if let Some(login) = &self.login {
            if login.0 != principal || login.1 != credential {
                log::warn!("Memory tier rejected principal '{}'", principal);
                return Err(ConnectError::Rejected(principal.to_string()));
            }
        }

        let mut tree = self.tree.lock().expect("MemoryTier lock poisoned");
        tree.next_session += 1;
        let id = tree.next_session;
        tree.live_sessions.insert(id);
        drop(tree);

        log::info!("Memory tier session {} opened for '{}'", id, principal);
        Ok(MemorySession {
            id,
            label: format!("mem-{}", id),
            tier: self.clone(),
        })
    }

    /// Drops every session at once, as a lost connection would.
    pub fn sever(&self) {
        let mut tree = self.tree.lock().expect("MemoryTier lock poisoned");
        let count = tree.live_sessions.len();
        tree.live_sessions.clear();
        tree.watchers.clear();
        log::warn!("Memory tier severed {} session(s)", count);
    }

    /// Current value of a topic.
    pub fn topic_value(&self, path: &str) -> Option<Payload> {
        let tree = self.tree.lock().expect("MemoryTier lock poisoned");
        tree.topics.get(path).and_then(|entry| entry.value.clone())
    }

    /// Spec of a topic, if it exists.
    pub fn topic_spec(&self, path: &str) -> Option<TopicSpec> {
        let tree = self.tree.lock().expect("MemoryTier lock poisoned");
        tree.topics.get(path).map(|entry| entry.spec)
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.tree.lock().expect("MemoryTier lock poisoned").live_sessions.len()
    }

    /// Successful session publishes so far. View projections are not counted.
    pub fn publish_count(&self) -> u64 {
        self.counters.publishes.load(Ordering::SeqCst)
    }

    /// `ensure_topic` calls received so far, including no-op ones.
    pub fn ensure_count(&self) -> u64 {
        self.counters.ensures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TierConnector for MemoryTier {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TierSession>, ConnectError> {
        let session = self.open_session(&credentials.principal, &credentials.credential)?;
        Ok(Arc::new(session))
    }
}

/// A session on a [`MemoryTier`].
pub struct MemorySession {
    id: u64,
    label: String,
    tier: MemoryTier,
}

impl MemorySession {
    fn tree(&self) -> std::sync::MutexGuard<'_, TopicTree> {
        self.tier.tree.lock().expect("MemoryTier lock poisoned")
    }

    /// Whether the session is still open.
    pub fn is_live(&self) -> bool {
        self.tree().live_sessions.contains(&self.id)
    }
}

#[async_trait]
impl TierSession for MemorySession {
    fn session_id(&self) -> &str {
        &self.label
    }

    async fn ensure_topic(&self, path: &str, spec: TopicSpec) -> Result<(), TopicError> {
        validate_path(path)?;
        let mut tree = self.tree();
        if !tree.live_sessions.contains(&self.id) {
            return Err(TopicError::Disconnected);
        }
        self.tier.counters.ensures.fetch_add(1, Ordering::SeqCst);
        if tree.ensure(path, spec)? {
            log::info!("Topic '{}' created as {}", path, spec.value_type);
        }
        Ok(())
    }

    async fn publish(&self, path: &str, value: &Payload) -> Result<(), TierError> {
        let mut tree = self.tree();
        if !tree.live_sessions.contains(&self.id) {
            return Err(TierError::Disconnected);
        }
        tree.write(path, value.clone(), false)?;
        self.tier.counters.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<TopicStream, TierError> {
        validate_path(path).map_err(|e| TierError::Protocol(e.to_string()))?;
        let mut tree = self.tree();
        if !tree.live_sessions.contains(&self.id) {
            return Err(TierError::Disconnected);
        }
        Ok(tree.watch(self.id, path))
    }

    async fn create_topic_view(&self, name: &str, spec: &str) -> Result<(), TopicError> {
        let view = TopicView::parse(name, spec)?;
        let mut tree = self.tree();
        if !tree.live_sessions.contains(&self.id) {
            return Err(TopicError::Disconnected);
        }
        tree.add_view(view)?;
        log::info!("Topic view '{}' created: {}", name, spec);
        Ok(())
    }

    async fn close(&self) {
        if self.tree().drop_session(self.id) {
            log::info!("Memory tier session {} closed", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secondary::ValueType;

    fn json() -> TopicSpec {
        TopicSpec::new(ValueType::Json)
    }

    #[tokio::test]
    async fn test_ensure_topic_is_idempotent_but_type_checked() {
        let tier = MemoryTier::new();
        let session = tier.open_session("admin", "password").unwrap();

        session.ensure_topic("redis/bitcoin", json()).await.unwrap();
        session.ensure_topic("redis/bitcoin", json()).await.unwrap();
        assert_eq!(tier.ensure_count(), 2);

        let err = session
            .ensure_topic("redis/bitcoin", TopicSpec::new(ValueType::String))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TopicError::TypeConflict { existing: ValueType::Json, requested: ValueType::String, .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_existing_topic_and_valid_value() {
        let tier = MemoryTier::new();
        let session = tier.open_session("admin", "password").unwrap();

        let missing = session.publish("nope", &Payload::from("{}")).await.unwrap_err();
        assert!(matches!(missing, TierError::NoSuchTopic(_)));

        session.ensure_topic("t", json()).await.unwrap();
        let invalid = session.publish("t", &Payload::from("{oops")).await.unwrap_err();
        assert!(matches!(invalid, TierError::InvalidValue { .. }));
        assert_eq!(tier.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_updates_carry_old_and_new_values() {
        let tier = MemoryTier::new();
        let session = tier.open_session("admin", "password").unwrap();
        session.ensure_topic("t", json()).await.unwrap();
        let mut updates = session.subscribe("t").await.unwrap();

        session.publish("t", &Payload::from(r#"{"v":1}"#)).await.unwrap();
        session.publish("t", &Payload::from(r#"{"v":2}"#)).await.unwrap();

        let first = updates.recv().await.unwrap();
        assert_eq!(first.new_value, Payload::from(r#"{"v":1}"#));
        assert!(first.old_value.is_none());

        let second = updates.recv().await.unwrap();
        assert_eq!(second.new_value, Payload::from(r#"{"v":2}"#));
        assert_eq!(second.old_value, Some(Payload::from(r#"{"v":1}"#)));
        assert_eq!(second.spec, json());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_value_first() {
        let tier = MemoryTier::new();
        let writer = tier.open_session("a", "b").unwrap();
        writer.ensure_topic("t", json()).await.unwrap();
        writer.publish("t", &Payload::from("[1]")).await.unwrap();

        let reader = tier.open_session("c", "d").unwrap();
        let mut updates = reader.subscribe("t").await.unwrap();
        let current = updates.recv().await.unwrap();
        assert_eq!(current.new_value, Payload::from("[1]"));
        assert!(current.old_value.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_before_topic_exists() {
        let tier = MemoryTier::new();
        let session = tier.open_session("a", "b").unwrap();
        let mut updates = session.subscribe("later").await.unwrap();

        session.ensure_topic("later", json()).await.unwrap();
        session.publish("later", &Payload::from("true")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().new_value, Payload::from("true"));
    }

    #[tokio::test]
    async fn test_login_is_enforced() {
        let tier = MemoryTier::new().with_login("admin", "password");
        assert!(matches!(
            tier.open_session("admin", "wrong"),
            Err(ConnectError::Rejected(p)) if p == "admin"
        ));
        assert!(tier.open_session("admin", "password").is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_fails_and_ends_streams() {
        let tier = MemoryTier::new();
        let session = tier.open_session("a", "b").unwrap();
        session.ensure_topic("t", json()).await.unwrap();
        let mut updates = session.subscribe("t").await.unwrap();

        session.close().await;
        session.close().await;
        assert!(!session.is_live());
        assert!(updates.recv().await.is_none());
        assert!(matches!(
            session.publish("t", &Payload::from("1")).await,
            Err(TierError::Disconnected)
        ));
        assert!(matches!(session.ensure_topic("t", json()).await, Err(TopicError::Disconnected)));
    }

    #[tokio::test]
    async fn test_sever_drops_every_session() {
        let tier = MemoryTier::new();
        let a = tier.open_session("a", "b").unwrap();
        let b = tier.open_session("a", "b").unwrap();
        let mut stream = b.subscribe("t").await.unwrap();
        assert_eq!(tier.session_count(), 2);

        tier.sever();
        assert_eq!(tier.session_count(), 0);
        assert!(!a.is_live());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_topic_view_projects_and_is_read_only() {
        let tier = MemoryTier::new();
        let session = tier.open_session("a", "b").unwrap();
        session.ensure_topic("redis/bitcoin", json()).await.unwrap();
        session
            .publish("redis/bitcoin", &Payload::from(r#"{"bpi":{"USD":{"rate_float":1.5}}}"#))
            .await
            .unwrap();

        session
            .create_topic_view("usd", "map redis/bitcoin to views/usd as /bpi/USD/rate_float")
            .await
            .unwrap();
        // Same definition again is accepted.
        session
            .create_topic_view("usd", "map redis/bitcoin to views/usd as /bpi/USD/rate_float")
            .await
            .unwrap();
        assert_eq!(tier.topic_value("views/usd"), Some(Payload::from("1.5")));
        assert!(tier.topic_spec("views/usd").unwrap().read_only);

        let mut view_updates = session.subscribe("views/usd").await.unwrap();
        assert_eq!(view_updates.recv().await.unwrap().new_value, Payload::from("1.5"));

        session
            .publish("redis/bitcoin", &Payload::from(r#"{"bpi":{"USD":{"rate_float":2.0}}}"#))
            .await
            .unwrap();
        let update = view_updates.recv().await.unwrap();
        assert_eq!(update.new_value, Payload::from("2.0"));
        assert_eq!(update.old_value, Some(Payload::from("1.5")));

        let err = session.publish("views/usd", &Payload::from("3")).await.unwrap_err();
        assert!(matches!(err, TierError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_topic_view_needs_source_and_fresh_target() {
        let tier = MemoryTier::new();
        let session = tier.open_session("a", "b").unwrap();
        assert!(matches!(
            session.create_topic_view("v", "map missing to out").await,
            Err(TopicError::InvalidView(_))
        ));

        session.ensure_topic("src", json()).await.unwrap();
        session.ensure_topic("taken", json()).await.unwrap();
        assert!(session.create_topic_view("v", "map src to taken").await.is_err());
        session.create_topic_view("v", "map src to out").await.unwrap();
        assert!(session.create_topic_view("v", "map src to other").await.is_err());
    }
}
