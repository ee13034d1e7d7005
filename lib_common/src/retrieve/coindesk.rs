//! # Price Index HTTP Source
//!
//! One GET per `fetch`. The body is validated against [`BitcoinPrice`] and
//! then returned as-is: the payload bytes are the bytes the server sent.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::payload::Payload;
use crate::errors::FetchError;
use crate::retrieve::{BitcoinPrice, ExternalSource};

/// Default endpoint of the current price index.
pub const DEFAULT_URL: &str = "https://api.coindesk.com/v1/bpi/currentprice.json";

/// A polled source for the Bitcoin price index.
pub struct CoindeskSource {
    url: String,
    timeout: Duration,
    /// Reused across polls for connection pooling.
    client: reqwest::Client,
}

impl CoindeskSource {
    /// Creates a source for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("lib_common/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(), // Fallback to a default client if builder fails.
        }
    }

    /// The polled URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_decode() || err.is_body() {
            FetchError::MalformedBody(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl ExternalSource for CoindeskSource {
    async fn fetch(&self) -> Result<Payload, FetchError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let price = BitcoinPrice::parse(&body).map_err(|e| FetchError::MalformedBody(e.to_string()))?;
        log::debug!(
            "Fetched price index updated '{}' with {} currencies ({} bytes)",
            price.time.updated,
            price.bpi.len(),
            body.len()
        );
        Ok(Payload::from_bytes(body))
    }
}
