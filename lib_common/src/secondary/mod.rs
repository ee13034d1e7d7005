//! # Secondary Topic Tier
//!
//! A topic-addressed pub/sub tier that sits beside the primary broker. Unlike a
//! broker channel, a topic is typed and must be provisioned with
//! `ensure_topic` before the first publish. A subscription reports each change
//! as a [`TopicUpdate`] carrying both the new and the previous value.
//!
//! ## Contained Modules:
//!
//! - **`memory_tier`**: an in-process tier, used by tests and by `topic_hub`.
//! - **`topic_view`**: read-only projections of one topic onto another.
//! - **`protocol`**: JSON frames for running the tier over a WebSocket.
//! - **`ws_client`** / **`hub`**: both ends of that WebSocket (feature
//!   `secondary-ws`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::payload::Payload;
use crate::errors::{ConnectError, TierError, TopicError};

/// In-process tier implementation.
pub mod memory_tier;
/// Wire frames for the WebSocket transport.
pub mod protocol;
/// Topic view specs and projection.
pub mod topic_view;

/// Server side of the WebSocket transport.
#[cfg(feature = "secondary-ws")]
pub mod hub;
/// Client side of the WebSocket transport.
#[cfg(feature = "secondary-ws")]
pub mod ws_client;

pub use memory_tier::{MemorySession, MemoryTier};
pub use topic_view::TopicView;
#[cfg(feature = "secondary-ws")]
pub use hub::TierHub;
#[cfg(feature = "secondary-ws")]
pub use ws_client::WsTierConnector;

/// Value type of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Any well-formed JSON document.
    Json,
    /// Any UTF-8 text.
    String,
}

impl ValueType {
    /// Whether `payload` is a valid value for a topic of this type.
    pub fn accepts(&self, payload: &Payload) -> bool {
        match self {
            ValueType::Json => serde_json::from_slice::<serde::de::IgnoredAny>(payload.as_bytes()).is_ok(),
            ValueType::String => payload.as_str().is_some(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Json => f.write_str("json"),
            ValueType::String => f.write_str("string"),
        }
    }
}

/// Properties a topic is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSpec {
    /// Type every published value must satisfy.
    pub value_type: ValueType,
    /// Read-only topics only change through a topic view.
    #[serde(default)]
    pub read_only: bool,
}

impl TopicSpec {
    /// A writable topic of the given type.
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            read_only: false,
        }
    }
}

/// One change on a subscribed topic.
#[derive(Debug, Clone)]
pub struct TopicUpdate {
    /// Topic path.
    pub path: String,
    /// The topic's spec.
    pub spec: TopicSpec,
    /// Value after the change.
    pub new_value: Payload,
    /// Value before the change. `None` for the first value, or for the current
    /// value delivered right after subscribing.
    pub old_value: Option<Payload>,
}

/// Updates for one subscription. Ends when the session is closed or lost.
pub type TopicStream = mpsc::UnboundedReceiver<TopicUpdate>;

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Tier host name or address.
    pub host: String,
    /// User name.
    pub principal: String,
    /// Password.
    pub credential: String,
    /// Tier port.
    pub port: u16,
    /// Use TLS.
    pub secure: bool,
}

impl Credentials {
    /// The WebSocket URL for `path` on this endpoint.
    pub fn endpoint_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }

    /// `host:port`, used to tell tiers apart.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("principal", &self.principal)
            .field("credential", &"<redacted>")
            .field("port", &self.port)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Checks a topic path: non-empty `/`-separated segments without whitespace.
pub fn validate_path(path: &str) -> Result<(), TopicError> {
    let valid = !path.is_empty()
        && path.split('/').all(|segment| !segment.is_empty())
        && !path.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(TopicError::InvalidPath(path.to_string()))
    }
}

/// # Tier Connector
///
/// Opens sessions on a secondary tier.
#[async_trait]
pub trait TierConnector: Send + Sync {
    /// Authenticates and returns an open session.
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TierSession>, ConnectError>;
}

/// # Tier Session
///
/// One authenticated connection. Once closed or lost, every operation fails
/// with a `Disconnected` error and every subscription stream ends.
#[async_trait]
pub trait TierSession: Send + Sync {
    /// Identifier assigned by the tier.
    fn session_id(&self) -> &str;

    /// Creates the topic if missing. An existing topic of the same type is not
    /// an error; one of a different type is `TopicError::TypeConflict`.
    async fn ensure_topic(&self, path: &str, spec: TopicSpec) -> Result<(), TopicError>;

    /// Sets the topic's value.
    async fn publish(&self, path: &str, value: &Payload) -> Result<(), TierError>;

    /// Streams changes to `path`, starting with its current value if it has
    /// one. Subscribing before the topic exists is allowed.
    async fn subscribe(&self, path: &str) -> Result<TopicStream, TierError>;

    /// Creates a read-only view topic from a spec of the form
    /// `map <source> to <target> [as <json-pointer>]`.
    async fn create_topic_view(&self, name: &str, spec: &str) -> Result<(), TopicError>;

    /// Closes the session. Idempotent.
    async fn close(&self);
}
