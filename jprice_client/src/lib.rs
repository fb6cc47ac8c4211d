// Historical token price client (price-at-timestamp endpoint)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use history_core::PriceRecord;
pub use history_core::INVALID_PRICE_DATA;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use resource_manager::{EgressClients, Resource};
use retry_utils::{parse_retry_after, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PriceClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Rate limit exceeded: {detail}")]
    RateLimit {
        retry_after: Option<Duration>,
        detail: String,
    },
    #[error("HTTP {status}: {detail}")]
    Status { status: StatusCode, detail: String },
}

impl From<PriceClientError> for FetchError {
    fn from(err: PriceClientError) -> Self {
        match err {
            PriceClientError::Http(e) => FetchError::Network(e.to_string()),
            PriceClientError::Json(e) => FetchError::Terminal(format!("Invalid price response: {}", e)),
            PriceClientError::RateLimit { retry_after, detail } => FetchError::RateLimited { retry_after, detail },
            PriceClientError::Status { status, detail } if status.is_server_error() => {
                FetchError::ServerError(format!("HTTP {}: {}", status, detail))
            }
            PriceClientError::Status { status, detail } => FetchError::Terminal(format!("HTTP {}: {}", status, detail)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceClientConfig {
    pub api_url: String,
    /// Request timeout in seconds
    pub request_timeout_seconds: u64,
}

impl Default for PriceClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://data.solanatracker.io".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

/// Body of a successful price-history response.
///
/// Fields are loosely typed: the provider sends `error` instead of a price
/// for unknown tokens, and numbers occasionally arrive as strings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PriceQuote {
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

impl PriceQuote {
    pub fn price_value(&self) -> Option<f64> {
        self.price.as_ref().and_then(number_of).filter(|price| price.is_finite())
    }

    /// Response timestamp if present, else the queried one, must be a real instant
    pub fn has_valid_timestamp(&self, queried_ms: i64) -> bool {
        match &self.timestamp {
            None | Some(Value::Null) => DateTime::<Utc>::from_timestamp_millis(queried_ms).is_some(),
            Some(Value::String(s)) => {
                DateTime::parse_from_rfc3339(s).is_ok()
                    || s.trim()
                        .parse::<i64>()
                        .ok()
                        .and_then(DateTime::<Utc>::from_timestamp_millis)
                        .is_some()
            }
            Some(value) => number_of(value)
                .filter(|n| n.is_finite())
                .and_then(|n| DateTime::<Utc>::from_timestamp_millis(n as i64))
                .is_some(),
        }
    }

    /// Price record for `mint` queried at `block_time` seconds
    pub fn into_record(self, mint: &str, block_time: i64) -> PriceRecord {
        let queried_ms = block_time.saturating_mul(1000);

        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            return PriceRecord::failed(mint, block_time, error);
        }

        match (self.price_value(), self.pool.as_deref()) {
            (Some(price), Some(pool)) if self.has_valid_timestamp(queried_ms) => {
                PriceRecord::valid(mint, block_time, price, pool)
            }
            _ => PriceRecord::failed(mint, block_time, INVALID_PRICE_DATA),
        }
    }
}

#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch_price(
        &self,
        mint: &str,
        timestamp_ms: i64,
        api_key: &Resource,
        proxy: &Resource,
    ) -> Result<PriceQuote, FetchError>;
}

/// Classify a price-history response
pub fn interpret_response(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<PriceQuote, PriceClientError> {
    let parsed: Result<PriceQuote, serde_json::Error> = serde_json::from_str(body);
    let body_error = parsed.as_ref().ok().and_then(|quote| quote.error.clone());

    let rate_limited_body = body_error
        .as_deref()
        .map(|e| e.to_lowercase().contains("rate limit"))
        .unwrap_or(false);

    if status == StatusCode::TOO_MANY_REQUESTS || rate_limited_body {
        return Err(PriceClientError::RateLimit {
            retry_after,
            detail: body_error.unwrap_or_else(|| format!("HTTP {}", status)),
        });
    }

    if !status.is_success() {
        return Err(PriceClientError::Status {
            status,
            detail: body_error.unwrap_or_else(|| body.chars().take(200).collect()),
        });
    }

    Ok(parsed?)
}

pub struct PriceHistoryClient {
    config: PriceClientConfig,
    egress: Arc<EgressClients>,
}

impl PriceHistoryClient {
    pub fn new(config: PriceClientConfig, egress: Arc<EgressClients>) -> Self {
        Self { config, egress }
    }

    async fn request(
        &self,
        mint: &str,
        timestamp_ms: i64,
        api_key: &Resource,
        proxy: &Resource,
    ) -> Result<PriceQuote, PriceClientError> {
        let url = format!("{}/price/history/timestamp", self.config.api_url.trim_end_matches('/'));
        debug!("Fetching price for {} at {} with key {} via {}", mint, timestamp_ms, api_key, proxy);

        let client = self.egress.client_for(proxy)?;
        let response = client
            .get(&url)
            .query(&[("token", mint.to_string()), ("timestamp", timestamp_ms.to_string())])
            .header("x-api-key", api_key.identity())
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
        );
        let body = response.text().await?;

        interpret_response(status, retry_after, &body)
    }
}

#[async_trait]
impl PriceFetcher for PriceHistoryClient {
    async fn fetch_price(
        &self,
        mint: &str,
        timestamp_ms: i64,
        api_key: &Resource,
        proxy: &Resource,
    ) -> Result<PriceQuote, FetchError> {
        Ok(self.request(mint, timestamp_ms, api_key, proxy).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retry_utils::RetryableError;

    #[test]
    fn test_429_is_rate_limited() {
        let err = interpret_response(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), "").unwrap_err();
        let fetch_err = FetchError::from(err);
        assert_eq!(fetch_err.classify(), RetryableError::RateLimit);
        assert_eq!(fetch_err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_rate_limit_body_is_rate_limited() {
        let err = interpret_response(StatusCode::OK, None, r#"{"error":"API rate limit reached"}"#).unwrap_err();
        assert_eq!(FetchError::from(err).classify(), RetryableError::RateLimit);
    }

    #[test]
    fn test_status_classification() {
        let server = interpret_response(StatusCode::INTERNAL_SERVER_ERROR, None, "oops").unwrap_err();
        let unauthorized = interpret_response(StatusCode::UNAUTHORIZED, None, r#"{"error":"bad key"}"#).unwrap_err();

        assert_eq!(FetchError::from(server).classify(), RetryableError::ServerError);
        assert_eq!(
            FetchError::from(unauthorized),
            FetchError::Terminal("HTTP 401 Unauthorized: bad key".to_string())
        );
    }

    #[test]
    fn test_valid_quote_becomes_valid_record() {
        let quote = interpret_response(
            StatusCode::OK,
            None,
            r#"{"price":0.0123,"pool":"PoolA","timestamp":1700000000000}"#,
        )
        .unwrap();

        let record = quote.into_record("MintA", 1_700_000_000);
        assert!(record.is_valid());
        assert_eq!(record.price, Some(0.0123));
        assert_eq!(record.pool.as_deref(), Some("PoolA"));
    }

    #[test]
    fn test_error_body_becomes_null_record() {
        let quote = interpret_response(StatusCode::OK, None, r#"{"error":"Token not found"}"#).unwrap();

        let record = quote.into_record("MintA", 1_700_000_000);
        assert!(record.price.is_none());
        assert_eq!(record.error.as_deref(), Some("Token not found"));
    }

    #[test]
    fn test_missing_pool_is_invalid_price_data() {
        let quote = interpret_response(StatusCode::OK, None, r#"{"price":1.5}"#).unwrap();

        let record = quote.into_record("MintA", 1_700_000_000);
        assert_eq!(record.error.as_deref(), Some(INVALID_PRICE_DATA));
    }

    #[test]
    fn test_string_price_accepted_and_bad_timestamp_rejected() {
        let quote = PriceQuote {
            price: Some(Value::String("2.5".to_string())),
            pool: Some("PoolA".to_string()),
            timestamp: None,
            error: None,
        };
        assert_eq!(quote.price_value(), Some(2.5));
        assert!(quote.clone().into_record("MintA", 100).is_valid());

        let bad_time = PriceQuote {
            timestamp: Some(Value::String("not a date".to_string())),
            ..quote
        };
        assert_eq!(bad_time.into_record("MintA", 100).error.as_deref(), Some(INVALID_PRICE_DATA));
    }
}
