//! Bitcoin price index document.
//!
//! ```json
//! {
//!   "time": {"updated": "Oct 17, 2026 09:00:00 UTC", "updatedISO": "2026-10-17T09:00:00+00:00"},
//!   "disclaimer": "...",
//!   "chartName": "Bitcoin",
//!   "bpi": {"USD": {"code": "USD", "rate": "50,000.0000", "description": "United States Dollar", "rate_float": 50000.0}}
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Timestamps of the quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTime {
    /// Human-readable update time.
    pub updated: String,
    /// ISO-8601 update time.
    #[serde(rename = "updatedISO", default, skip_serializing_if = "Option::is_none")]
    pub updated_iso: Option<String>,
}

/// One currency's rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyRate {
    /// ISO currency code.
    #[serde(default)]
    pub code: String,
    /// Formatted rate, e.g. `"50,000.0000"`.
    #[serde(default)]
    pub rate: String,
    /// Currency name.
    #[serde(default)]
    pub description: String,
    /// Numeric rate.
    pub rate_float: f64,
}

/// The full index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinPrice {
    /// When the quote was produced.
    pub time: PriceTime,
    /// Provider disclaimer.
    #[serde(default)]
    pub disclaimer: String,
    /// Name of the charted asset.
    #[serde(default)]
    pub chart_name: String,
    /// Rates keyed by currency code.
    pub bpi: BTreeMap<String, CurrencyRate>,
}

impl BitcoinPrice {
    /// Parses and validates a document. At least one currency must be present.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let price: Self = serde_json::from_slice(body)?;
        if price.bpi.is_empty() {
            return Err(serde::de::Error::custom("bpi has no currencies"));
        }
        Ok(price)
    }

    /// Numeric rate for a currency code, case-insensitive.
    pub fn rate(&self, code: &str) -> Option<f64> {
        self.bpi
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(code))
            .map(|(_, rate)| rate.rate_float)
    }
}
