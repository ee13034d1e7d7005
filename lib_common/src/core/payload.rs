//! # Payload and Delivery Envelope
//!
//! A `Payload` is the exact byte sequence produced at the source boundary. The
//! bridge, the broker and the secondary tier all move it around untouched; the
//! only metadata ever added lives beside it in a [`Delivery`], built at the
//! consuming edge.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// An opaque, serialized record. Cloning is cheap (reference counted).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Payload(Bytes);

impl Payload {
    /// Wraps raw bytes without inspecting them.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serializes `value` as JSON.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Borrows the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Returns the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserializes the payload into a declared schema.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Parses the payload into a generic JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }
}

/// Which delivery path brought a payload to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Relayed from the primary broker channel.
    Primary,
    /// Echoed back from the secondary topic tier.
    Secondary,
}

/// A payload as seen by a consumer, with edge-only metadata.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The relayed payload, byte-identical to what was published upstream.
    pub payload: Payload,
    /// The tier the payload arrived from.
    pub origin: Origin,
    /// The secondary-tier topic path for `Origin::Secondary` deliveries.
    pub topic: Option<String>,
    /// Wall-clock time the payload reached this process.
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// A delivery from the primary channel, stamped now.
    pub fn primary(payload: Payload) -> Self {
        Self {
            payload,
            origin: Origin::Primary,
            topic: None,
            received_at: Utc::now(),
        }
    }

    /// A delivery echoed from a secondary-tier topic, stamped now.
    pub fn secondary(payload: Payload, topic: impl Into<String>) -> Self {
        Self {
            payload,
            origin: Origin::Secondary,
            topic: Some(topic.into()),
            received_at: Utc::now(),
        }
    }
}
