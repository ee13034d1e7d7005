//! # Data Retrieval Module
//!
//! Adapters for external polled sources. An adapter performs exactly one
//! network call per `fetch` and never retries on its own: the poller's fixed
//! interval is the only retry policy in the system. Errors come back
//! classified so the poller's error sink can tell a timeout from a bad body.
//!
//! ## Contained Modules:
//!
//! - **`price`**: the declared schema of the Bitcoin price index document.
//!   The relay path never looks inside payloads; only this boundary does.
//! - **`coindesk`**: a `reqwest` adapter for the price index endpoint
//!   (feature `retrieve`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;

use crate::core::payload::Payload;
use crate::errors::FetchError;

/// Bitcoin price index schema.
pub mod price;

/// HTTP adapter for the price index endpoint.
#[cfg(feature = "retrieve")]
pub mod coindesk;

pub use price::{BitcoinPrice, CurrencyRate, PriceTime};
#[cfg(feature = "retrieve")]
pub use coindesk::CoindeskSource;

/// # External Source
///
/// One call to an external system that yields a payload or a classified error.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// Performs one fetch. No retry.
    async fn fetch(&self) -> Result<Payload, FetchError>;
}
