//! Decimal parsing helpers
//!
//! Exchanges send prices and sizes either as strings or as JSON numbers.
//! Both are converted straight to [`Decimal`] without passing through `f64`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{MarketDataError, Result};

/// Parse a decimal from its wire representation, accepting scientific notation.
pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| MarketDataError::Decode(format!("invalid decimal `{}`: {}", raw, e)))
}

/// Convert a JSON string or number into a decimal.
pub fn decimal_from_value(value: &Value) -> Result<Decimal> {
    match value {
        Value::String(s) => parse_decimal(s),
        // With serde_json's arbitrary_precision a number displays its literal digits.
        Value::Number(n) => parse_decimal(&n.to_string()),
        other => Err(MarketDataError::Decode(format!(
            "expected decimal, got {}",
            other
        ))),
    }
}

/// Look up `key` in a JSON object and convert it into a decimal.
pub fn decimal_field(value: &Value, key: &str) -> Result<Decimal> {
    value
        .get(key)
        .ok_or_else(|| MarketDataError::missing(key))
        .and_then(decimal_from_value)
}

/// Serde adapter for decimals sent as strings or numbers
pub fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decimal_from_value(&value).map_err(serde::de::Error::custom)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Parse an RFC 3339 timestamp into milliseconds since the Unix epoch.
pub fn rfc3339_millis(raw: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis().max(0) as u64)
}
