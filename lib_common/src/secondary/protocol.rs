//! Wire frames for the secondary tier over WebSocket.
//!
//! Every frame is one JSON text message tagged by `op`. Requests carry a
//! client-chosen `id` that the matching `ack` or `error` echoes back. Values
//! travel as JSON strings holding the payload text, so the bytes a subscriber
//! sees are exactly the bytes that were published.
//!
//! ```text
//! -> {"op":"connect","principal":"admin","credential":"password"}
//! <- {"op":"connected","sessionId":"mem-1"}
//! -> {"op":"publish","id":3,"path":"redis/bitcoin","value":"{\"v\":1}"}
//! <- {"op":"ack","id":3}
//! <- {"op":"update","path":"redis/bitcoin","spec":{...},"newValue":"{\"v\":1}","oldValue":null}
//! ```

use serde::{Deserialize, Serialize};

use crate::core::payload::Payload;
use crate::errors::{TierError, TopicError};
use crate::secondary::{TopicSpec, TopicUpdate, ValueType};

/// Frames sent by a tier client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame on every connection.
    Connect {
        /// Login name.
        principal: String,
        /// Password for `principal`.
        credential: String,
    },
    /// Create a topic if missing.
    EnsureTopic {
        /// Request id.
        id: u64,
        /// Topic path.
        path: String,
        /// Type the topic must have.
        value_type: ValueType,
    },
    /// Set a topic's value.
    Publish {
        /// Request id.
        id: u64,
        /// Topic path.
        path: String,
        /// Payload text.
        value: String,
    },
    /// Start streaming a topic's updates.
    Subscribe {
        /// Request id.
        id: u64,
        /// Topic path.
        path: String,
    },
    /// Create a topic view.
    CreateTopicView {
        /// Request id.
        id: u64,
        /// View name.
        name: String,
        /// `map <source> to <target> [as <pointer>]`.
        spec: String,
    },
}

/// Frames sent by the tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Reply to `connect`.
    Connected {
        /// Session assigned by the tier.
        session_id: String,
    },
    /// Request `id` succeeded.
    Ack {
        /// Id of the request.
        id: u64,
    },
    /// Request `id` failed, or the connection failed when `id` is absent.
    Error {
        /// Id of the failed request.
        id: Option<u64>,
        /// Error class.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// A change on a subscribed topic.
    Update {
        /// Topic path.
        path: String,
        /// Topic type.
        spec: TopicSpec,
        /// Value after the change.
        new_value: String,
        /// Value before the change, if any.
        old_value: Option<String>,
    },
}

/// Error classes carried in `ServerFrame::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Login refused.
    Rejected,
    /// Topic does not exist.
    NoSuchTopic,
    /// Topic is a view target.
    ReadOnly,
    /// Value does not fit the topic type.
    InvalidValue,
    /// Topic exists with another type.
    TypeConflict,
    /// Malformed topic path.
    InvalidPath,
    /// Malformed or unresolvable view.
    InvalidView,
    /// Session gone.
    Disconnected,
    /// Anything else, including undecodable frames.
    Protocol,
}

impl ErrorKind {
    /// Classifies a session error for the wire.
    pub fn of_tier(err: &TierError) -> Self {
        match err {
            TierError::NoSuchTopic(_) => Self::NoSuchTopic,
            TierError::ReadOnly(_) => Self::ReadOnly,
            TierError::InvalidValue { .. } => Self::InvalidValue,
            TierError::Disconnected => Self::Disconnected,
            TierError::Protocol(_) => Self::Protocol,
        }
    }

    /// Classifies a topic error for the wire.
    pub fn of_topic(err: &TopicError) -> Self {
        match err {
            TopicError::TypeConflict { .. } => Self::TypeConflict,
            TopicError::InvalidPath(_) => Self::InvalidPath,
            TopicError::InvalidView(_) => Self::InvalidView,
            TopicError::Disconnected => Self::Disconnected,
        }
    }

    /// Rebuilds a session error on the client side.
    pub fn into_tier_error(self, path: &str, message: String) -> TierError {
        match self {
            Self::NoSuchTopic => TierError::NoSuchTopic(path.to_string()),
            Self::ReadOnly => TierError::ReadOnly(path.to_string()),
            Self::InvalidValue => TierError::InvalidValue {
                path: path.to_string(),
                reason: message,
            },
            Self::Disconnected => TierError::Disconnected,
            _ => TierError::Protocol(message),
        }
    }

    /// Rebuilds a topic error on the client side. `requested` is the type the
    /// client asked for; with two value types the existing one is the other.
    pub fn into_topic_error(self, path: &str, requested: Option<ValueType>, message: String) -> TopicError {
        match (self, requested) {
            (Self::TypeConflict, Some(requested)) => TopicError::TypeConflict {
                path: path.to_string(),
                existing: match requested {
                    ValueType::Json => ValueType::String,
                    ValueType::String => ValueType::Json,
                },
                requested,
            },
            (Self::InvalidPath, _) => TopicError::InvalidPath(path.to_string()),
            (Self::Disconnected, _) => TopicError::Disconnected,
            _ => TopicError::InvalidView(message),
        }
    }
}

impl ServerFrame {
    /// Error reply for request `id`.
    pub fn error(id: Option<u64>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            kind,
            message: message.into(),
        }
    }

    /// Encodes a topic update. Fails only for a non-UTF-8 payload, which no
    /// topic type accepts.
    pub fn update(update: &TopicUpdate) -> Option<Self> {
        Some(Self::Update {
            path: update.path.clone(),
            spec: update.spec,
            new_value: update.new_value.as_str()?.to_string(),
            old_value: match &update.old_value {
                Some(old) => Some(old.as_str()?.to_string()),
                None => None,
            },
        })
    }
}

/// Decodes an `Update` frame's fields back into a topic update.
pub fn decode_update(path: String, spec: TopicSpec, new_value: String, old_value: Option<String>) -> TopicUpdate {
    TopicUpdate {
        path,
        spec,
        new_value: Payload::from(new_value),
        old_value: old_value.map(Payload::from),
    }
}
