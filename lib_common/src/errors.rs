//! # Error Taxonomy
//!
//! One error type per failure domain. None of them is fatal to the process:
//! fetch and publish errors are reported and the owning loop keeps going,
//! connect and topic errors abort only a secondary-tier attach, and a
//! transport error stays local to its connection.

use std::time::Duration;

use thiserror::Error;

use crate::secondary::ValueType;

/// Failure of a single call to the external polled source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed body: {0}")]
    MalformedBody(String),
}

/// Failure of a broker publish or subscribe.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("channel '{channel}' rejected: {reason}")]
    Rejected { channel: String, reason: String },
}

/// Failure to open a secondary-tier session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("secondary tier unreachable: {0}")]
    Unreachable(String),

    #[error("principal '{0}' rejected")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Protocol(String),
}

/// Failure to create a topic or a topic view.
#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic '{path}' already exists as {existing}, requested {requested}")]
    TypeConflict {
        path: String,
        existing: ValueType,
        requested: ValueType,
    },

    #[error("invalid topic path '{0}'")]
    InvalidPath(String),

    #[error("invalid topic view: {0}")]
    InvalidView(String),

    #[error("session is disconnected")]
    Disconnected,
}

/// Failure of a publish or subscribe on an open secondary-tier session.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("no such topic '{0}'")]
    NoSuchTopic(String),

    #[error("topic '{0}' is read-only")]
    ReadOnly(String),

    #[error("value rejected by topic '{path}': {reason}")]
    InvalidValue { path: String, reason: String },

    #[error("session is disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure on one locally connected client transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport '{0}' closed")]
    Closed(String),

    #[error("transport '{id}' failed: {reason}")]
    Io { id: String, reason: String },
}

/// Outcome of a failed `attach_secondary_tier` call.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("an attach attempt is already in progress")]
    Busy,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[from] TierError),

    #[error("attach cancelled by a concurrent detach")]
    Cancelled,
}

/// Error returned by a consumer callback.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConsumerError(pub String);

impl ConsumerError {
    /// Builds a consumer error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
