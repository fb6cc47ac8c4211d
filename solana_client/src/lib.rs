// Solana JSON-RPC client for signature listings and transaction lookups

use async_trait::async_trait;
use history_core::{RawTransaction, SignatureRecord};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use resource_manager::{EgressClients, Resource};
use retry_utils::{parse_retry_after, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// JSON-RPC code some providers use for throttling
const RPC_RATE_LIMIT_CODE: i64 = 429;
/// Node is behind or unhealthy
const RPC_NODE_UNHEALTHY_CODE: i64 = -32005;
const RPC_INTERNAL_ERROR_CODE: i64 = -32603;

#[derive(Error, Debug)]
pub enum SolanaClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl SolanaClientError {
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            Self::Rpc { code, message } => {
                let message = message.to_lowercase();
                *code == RPC_RATE_LIMIT_CODE
                    || message.contains("rate limit")
                    || message.contains("too many requests")
            }
            _ => false,
        }
    }
}

impl From<SolanaClientError> for FetchError {
    fn from(err: SolanaClientError) -> Self {
        if err.is_rate_limit() {
            let retry_after = match &err {
                SolanaClientError::Status { retry_after, .. } => *retry_after,
                _ => None,
            };
            return FetchError::RateLimited {
                retry_after,
                detail: err.to_string(),
            };
        }

        match err {
            SolanaClientError::Http(e) => FetchError::Network(e.to_string()),
            SolanaClientError::Json(e) => FetchError::Terminal(format!("Invalid RPC response: {}", e)),
            SolanaClientError::Status { status, .. } if status.is_server_error() => {
                FetchError::ServerError(format!("HTTP {}", status))
            }
            SolanaClientError::Status { status, .. } => FetchError::Terminal(format!("HTTP {}", status)),
            SolanaClientError::Rpc { code, message }
                if code == RPC_NODE_UNHEALTHY_CODE || code == RPC_INTERNAL_ERROR_CODE =>
            {
                FetchError::ServerError(format!("RPC error {}: {}", code, message))
            }
            SolanaClientError::Rpc { code, message } => {
                FetchError::Terminal(format!("RPC error {}: {}", code, message))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolanaClientConfig {
    pub rpc_url: String,
    /// Request timeout in seconds
    pub rpc_timeout_seconds: u64,
}

impl Default for SolanaClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            rpc_timeout_seconds: 30,
        }
    }
}

/// Solana RPC response envelope
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// The two RPC methods the pipeline needs, each sent through a chosen proxy
#[async_trait]
pub trait RpcFetcher: Send + Sync {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: u32,
        before: Option<&str>,
        proxy: &Resource,
    ) -> Result<Vec<SignatureRecord>, FetchError>;

    /// `Ok(None)` when the node does not know the transaction
    async fn get_transaction(&self, signature: &str, proxy: &Resource) -> Result<Option<RawTransaction>, FetchError>;
}

/// Turn an HTTP status and body into the RPC `result` value
pub fn decode_rpc_body(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<Value, SolanaClientError> {
    if !status.is_success() {
        return Err(SolanaClientError::Status { status, retry_after });
    }

    let response: RpcResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(SolanaClientError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    Ok(response.result.unwrap_or(Value::Null))
}

pub fn decode_signatures(result: Value) -> Result<Vec<SignatureRecord>, SolanaClientError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(result)?)
}

pub fn decode_transaction(result: Value) -> Result<Option<RawTransaction>, SolanaClientError> {
    if result.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(result)?))
}

pub struct SolanaClient {
    config: SolanaClientConfig,
    egress: Arc<EgressClients>,
    request_id_counter: AtomicU64,
}

impl SolanaClient {
    pub fn new(config: SolanaClientConfig, egress: Arc<EgressClients>) -> Self {
        Self {
            config,
            egress,
            request_id_counter: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Generic RPC request through `proxy`
    async fn rpc_request(&self, method: &str, params: Value, proxy: &Resource) -> Result<Value, SolanaClientError> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": method,
            "params": params
        });

        debug!("{} via {}", method, proxy);

        let client = self.egress.client_for(proxy)?;
        let response = client
            .post(&self.config.rpc_url)
            .json(&request_body)
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

        decode_rpc_body(status, retry_after, &body)
    }
}

#[async_trait]
impl RpcFetcher for SolanaClient {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: u32,
        before: Option<&str>,
        proxy: &Resource,
    ) -> Result<Vec<SignatureRecord>, FetchError> {
        let mut options = serde_json::Map::new();
        options.insert("limit".to_string(), json!(limit));
        if let Some(before_sig) = before {
            options.insert("before".to_string(), json!(before_sig));
        }

        let result = self
            .rpc_request("getSignaturesForAddress", json!([address, options]), proxy)
            .await?;
        Ok(decode_signatures(result)?)
    }

    async fn get_transaction(&self, signature: &str, proxy: &Resource) -> Result<Option<RawTransaction>, FetchError> {
        let params = json!([
            signature,
            {"encoding": "json", "maxSupportedTransactionVersion": 0}
        ]);

        let result = self.rpc_request("getTransaction", params, proxy).await?;
        Ok(decode_transaction(result)?)
    }
}
