use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of `getSignaturesForAddress`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub signature: String,

    /// Seconds since epoch; the RPC reports null for some old slots
    pub block_time: Option<i64>,
}

/// Transaction as returned by `getTransaction`.
///
/// Only the fields the pipeline reads are typed; the rest of the payload is
/// kept verbatim so it can be persisted unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default)]
    pub block_time: Option<i64>,

    #[serde(default)]
    pub meta: Option<TransactionMeta>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub pre_token_balances: Option<Vec<TokenBalance>>,

    #[serde(default)]
    pub post_token_balances: Option<Vec<TokenBalance>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenBalance {
    #[serde(default)]
    pub mint: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawTransaction {
    pub fn pre_token_balances(&self) -> &[TokenBalance] {
        self.meta
            .as_ref()
            .and_then(|meta| meta.pre_token_balances.as_deref())
            .unwrap_or(&[])
    }

    pub fn post_token_balances(&self) -> &[TokenBalance] {
        self.meta
            .as_ref()
            .and_then(|meta| meta.post_token_balances.as_deref())
            .unwrap_or(&[])
    }
}

/// A fetched transaction paired with the signature it was requested for
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedTransaction {
    pub signature: SignatureRecord,
    pub transaction: RawTransaction,
}

impl FetchedTransaction {
    /// Block time from the signature listing, else from the transaction itself
    pub fn block_time(&self) -> Option<i64> {
        self.signature.block_time.or(self.transaction.block_time)
    }
}

/// Error text of a price lookup whose response carried no usable price
pub const INVALID_PRICE_DATA: &str = "Invalid price data";

/// Transaction reduced to the token it touched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedRecord {
    pub signature: String,
    pub mint: String,
    /// Seconds since epoch
    pub block_time: i64,
    /// `block_time` in milliseconds
    pub timestamp: i64,
}

impl EnhancedRecord {
    pub fn new(signature: impl Into<String>, mint: impl Into<String>, block_time: i64) -> Self {
        Self {
            signature: signature.into(),
            mint: mint.into(),
            block_time,
            timestamp: block_time.saturating_mul(1000),
        }
    }

    /// Cache key for price lookups
    pub fn price_key(&self) -> String {
        format!("{}:{}", self.mint, self.block_time)
    }
}

/// Outcome of one historical price lookup.
///
/// Built through [`PriceRecord::valid`] or [`PriceRecord::failed`]: a record
/// either has a price and a pool and no error, or no price and an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub mint: String,
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Queried instant in milliseconds
    pub timestamp: i64,
    pub queried_block_time: i64,
    pub error: Option<String>,
    #[serde(rename = "timestamp_est")]
    pub timestamp_est: String,
}

impl PriceRecord {
    /// A non-finite `price` yields a failed record with [`INVALID_PRICE_DATA`]
    pub fn valid(mint: impl Into<String>, block_time: i64, price: f64, pool: impl Into<String>) -> Self {
        if !price.is_finite() {
            return Self::failed(mint, block_time, INVALID_PRICE_DATA);
        }
        let timestamp = block_time.saturating_mul(1000);
        Self {
            mint: mint.into(),
            price: Some(price),
            pool: Some(pool.into()),
            timestamp,
            queried_block_time: block_time,
            error: None,
            timestamp_est: format_est(timestamp),
        }
    }

    pub fn failed(mint: impl Into<String>, block_time: i64, error: impl Into<String>) -> Self {
        let timestamp = block_time.saturating_mul(1000);
        Self {
            mint: mint.into(),
            price: None,
            pool: None,
            timestamp,
            queried_block_time: block_time,
            error: Some(error.into()),
            timestamp_est: format_est(timestamp),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.price, Some(price) if price.is_finite())
            && self.pool.is_some()
            && self.error.is_none()
            && DateTime::<Utc>::from_timestamp_millis(self.timestamp).is_some()
    }
}

/// Millisecond timestamp as New York wall-clock time, e.g. `11/14/2023, 5:13:20 PM`
pub fn format_est(timestamp_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        Some(utc) => utc
            .with_timezone(&New_York)
            .format("%-m/%-d/%Y, %-I:%M:%S %p")
            .to_string(),
        None => "Invalid Date".to_string(),
    }
}
