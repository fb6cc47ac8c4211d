use async_trait::async_trait;
use config_manager::InputConfig;
use history_core::{PriceRecord, RawTransaction, SignatureRecord};
use job_orchestrator::{
    slots, OrchestratorError, PipelineOptions, PipelineOrchestrator, PipelineServices, SignatureStage,
};
use jprice_client::{PriceFetcher, PriceQuote};
use persistence_layer::{load_json, BlobStore, MemoryBlobStore, PersistenceError};
use resource_manager::{
    KeyedEgress, PoolConfig, RateLimiter, RateLimiterConfig, Resource, ResourceKind, ResourcePool, DIRECT_EGRESS,
};
use retry_utils::{FetchError, RetryConfig, RetryController};
use serde_json::{json, Value};
use solana_client::RpcFetcher;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tx_parser::WRAPPED_SOL_MINT;

const BLOCK_TIME: i64 = 1_700_000_000;

#[derive(Default)]
struct FakeRpc {
    signatures: HashMap<String, Vec<SignatureRecord>>,
    transactions: HashMap<String, RawTransaction>,
    /// `before` cursors whose page fails terminally
    failing_pages: HashSet<String>,
    failing_transactions: HashSet<String>,
    signature_calls: AtomicUsize,
    transaction_calls: Mutex<HashMap<String, usize>>,
}

impl FakeRpc {
    fn with_wallet(mut self, wallet: &str, signatures: &[&str]) -> Self {
        let records = signatures
            .iter()
            .map(|signature| SignatureRecord {
                signature: signature.to_string(),
                block_time: Some(BLOCK_TIME),
            })
            .collect();
        self.signatures.insert(wallet.to_string(), records);
        self
    }

    fn with_transaction(mut self, signature: &str, mint: &str) -> Self {
        let tx: RawTransaction = serde_json::from_value(json!({
            "slot": 42,
            "meta": {
                "preTokenBalances": [{ "mint": mint, "accountIndex": 1 }],
                "postTokenBalances": []
            }
        }))
        .unwrap();
        self.transactions.insert(signature.to_string(), tx);
        self
    }

    fn fail_page_after(mut self, cursor: &str) -> Self {
        self.failing_pages.insert(cursor.to_string());
        self
    }

    fn fail_transaction(mut self, signature: &str) -> Self {
        self.failing_transactions.insert(signature.to_string());
        self
    }

    fn transaction_calls_for(&self, signature: &str) -> usize {
        self.transaction_calls.lock().unwrap().get(signature).copied().unwrap_or(0)
    }

    fn total_transaction_calls(&self) -> usize {
        self.transaction_calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RpcFetcher for FakeRpc {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: u32,
        before: Option<&str>,
        _proxy: &Resource,
    ) -> Result<Vec<SignatureRecord>, FetchError> {
        self.signature_calls.fetch_add(1, Ordering::SeqCst);
        if before.is_some_and(|cursor| self.failing_pages.contains(cursor)) {
            return Err(FetchError::Terminal("HTTP 400".to_string()));
        }
        let all = self.signatures.get(address).cloned().unwrap_or_default();
        let start = match before {
            Some(cursor) => all
                .iter()
                .position(|record| record.signature == cursor)
                .map(|index| index + 1)
                .unwrap_or(all.len()),
            None => 0,
        };
        Ok(all.into_iter().skip(start).take(limit as usize).collect())
    }

    async fn get_transaction(&self, signature: &str, _proxy: &Resource) -> Result<Option<RawTransaction>, FetchError> {
        *self
            .transaction_calls
            .lock()
            .unwrap()
            .entry(signature.to_string())
            .or_insert(0) += 1;
        if self.failing_transactions.contains(signature) {
            return Err(FetchError::Terminal("RPC error -32602: invalid signature".to_string()));
        }
        Ok(self.transactions.get(signature).cloned())
    }
}

/// Serves scripted responses per mint; the last response repeats
#[derive(Default)]
struct FakePrices {
    responses: Mutex<HashMap<String, Vec<Result<PriceQuote, FetchError>>>>,
    calls: AtomicUsize,
    keys_seen: Mutex<Vec<String>>,
}

impl FakePrices {
    fn script(self, mint: &str, responses: Vec<Result<PriceQuote, FetchError>>) -> Self {
        self.responses.lock().unwrap().insert(mint.to_string(), responses);
        self
    }
}

fn quote(price: f64, pool: &str) -> PriceQuote {
    PriceQuote {
        price: Some(json!(price)),
        pool: Some(pool.to_string()),
        ..PriceQuote::default()
    }
}

fn missing_token() -> PriceQuote {
    PriceQuote {
        error: Some("Token not found".to_string()),
        ..PriceQuote::default()
    }
}

#[async_trait]
impl PriceFetcher for FakePrices {
    async fn fetch_price(
        &self,
        mint: &str,
        _timestamp_ms: i64,
        api_key: &Resource,
        _proxy: &Resource,
    ) -> Result<PriceQuote, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys_seen.lock().unwrap().push(api_key.identity().to_string());

        let mut responses = self.responses.lock().unwrap();
        let scripted = responses.entry(mint.to_string()).or_default();
        match scripted.len() {
            0 => Ok(missing_token()),
            1 => scripted[0].clone(),
            _ => scripted.remove(0),
        }
    }
}

/// Memory store that refuses to save one slot and records every attempt
struct FlakyStore {
    inner: MemoryBlobStore,
    refused: &'static str,
    attempted: Mutex<Vec<String>>,
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn load(&self, name: &str) -> persistence_layer::Result<Option<Value>> {
        self.inner.load(name).await
    }

    async fn save(&self, name: &str, value: &Value) -> persistence_layer::Result<()> {
        self.attempted.lock().unwrap().push(name.to_string());
        if name == self.refused {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save(name, value).await
    }
}

fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        base_cooldown: Duration::from_millis(50),
        success_cooldown: Duration::from_millis(1),
        max_failures: 3,
        check_interval: Duration::from_millis(1),
    }
}

fn pool(name: &str, kind: ResourceKind, identities: &[&str]) -> Arc<ResourcePool> {
    Arc::new(ResourcePool::new(name, kind, identities.iter().copied(), fast_pool_config()).unwrap())
}

fn services(rpc: Arc<FakeRpc>, prices: Arc<FakePrices>, store: Arc<dyn BlobStore>) -> PipelineServices {
    PipelineServices {
        rpc,
        prices,
        store,
        signature_proxies: pool("signature-proxies", ResourceKind::Proxy, &[DIRECT_EGRESS]),
        transaction_proxies: pool("transaction-proxies", ResourceKind::Proxy, &[DIRECT_EGRESS]),
        price_egress: KeyedEgress::new(
            pool("price-keys", ResourceKind::ApiKey, &["key-one", "key-two"]),
            pool("price-proxies", ResourceKind::Proxy, &[DIRECT_EGRESS]),
        ),
        signature_limiter: Arc::new(RateLimiter::new("signatures", RateLimiterConfig::default())),
        transaction_limiter: Arc::new(RateLimiter::new("transactions", RateLimiterConfig::default())),
        price_limiter: Arc::new(RateLimiter::new("prices", RateLimiterConfig::default())),
        wallet_limiter: Arc::new(RateLimiter::new(
            "wallets",
            RateLimiterConfig::concurrency_only(1, Duration::ZERO),
        )),
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(5),
        },
        signature_page_limit: 1000,
        max_signatures: 1000,
        transaction_batch_size: 2,
        price_batch_size: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_partitions_and_stores_slots() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S1", "S2", "S3"])
            .with_transaction("S1", "MintA")
            .with_transaction("S2", WRAPPED_SOL_MINT)
            .with_transaction("S3", "MintB"),
    );
    let prices = Arc::new(
        FakePrices::default()
            .script("MintA", vec![Ok(quote(1.5, "PoolA"))])
            .script("MintB", vec![Ok(missing_token())]),
    );
    let store = Arc::new(MemoryBlobStore::new().with_slot(slots::INPUT, json!({ "walletAddress": "W1" })).await);

    let orchestrator = PipelineOrchestrator::new(services(rpc.clone(), prices.clone(), store.clone()), options());
    let input = orchestrator.load_input().await.unwrap();
    let output = orchestrator.run_and_store(&input).await.unwrap();

    assert_eq!(output.stats.wallets, 1);
    assert_eq!(output.stats.signatures, 3);
    assert_eq!(output.stats.transactions, 3);
    assert_eq!(output.stats.enhanced, 2);
    assert_eq!(output.stats.valid_prices, 1);
    assert_eq!(output.stats.null_prices, 1);
    assert_eq!(prices.calls.load(Ordering::SeqCst), 2);

    let mut names = store.slot_names().await;
    names.sort();
    assert_eq!(
        names,
        vec![
            slots::ENHANCED_OUTPUT,
            slots::INPUT,
            slots::PRICES_NULL,
            slots::PRICES_VALID,
            slots::RAW_TRANSACTIONS,
            slots::SIGNATURES,
        ]
    );

    let valid: Vec<PriceRecord> = load_json(store.as_ref(), slots::PRICES_VALID).await.unwrap().unwrap();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].mint, "MintA");
    assert_eq!(valid[0].price, Some(1.5));
    assert_eq!(valid[0].timestamp, BLOCK_TIME * 1000);

    let null: Vec<PriceRecord> = load_json(store.as_ref(), slots::PRICES_NULL).await.unwrap().unwrap();
    assert_eq!(null[0].mint, "MintB");
    assert_eq!(null[0].error.as_deref(), Some("Token not found"));

    let raw = store.load(slots::RAW_TRANSACTIONS).await.unwrap().unwrap();
    assert_eq!(raw[0]["slot"], json!(42));
}

#[tokio::test(start_paused = true)]
async fn test_shared_signature_is_fetched_once_per_run() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S1", "Shared"])
            .with_wallet("W2", &["Shared"])
            .with_transaction("S1", "MintA")
            .with_transaction("Shared", "MintB"),
    );
    let prices = Arc::new(
        FakePrices::default()
            .script("MintA", vec![Ok(quote(1.0, "PoolA"))])
            .script("MintB", vec![Ok(quote(2.0, "PoolB"))]),
    );
    let orchestrator = PipelineOrchestrator::new(
        services(rpc.clone(), prices.clone(), Arc::new(MemoryBlobStore::new())),
        options(),
    );

    let output = orchestrator
        .run(&["W1".to_string(), "W2".to_string()])
        .await
        .unwrap();

    assert_eq!(rpc.transaction_calls_for("Shared"), 1);
    assert_eq!(rpc.total_transaction_calls(), 2);
    assert_eq!(prices.calls.load(Ordering::SeqCst), 2);
    assert_eq!(output.enhanced.len(), 3);
    assert_eq!(output.prices.len(), 3);
    assert_eq!(output.partitioned.valid.len(), 2);
    assert_eq!(output.enhanced[0].signature, "S1");
    assert_eq!(output.enhanced[2].signature, "Shared");

    // A new run starts with empty caches
    orchestrator.run(&["W2".to_string()]).await.unwrap();
    assert_eq!(rpc.transaction_calls_for("Shared"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_input_fetches_nothing() {
    let rpc = Arc::new(FakeRpc::default());
    let prices = Arc::new(FakePrices::default());
    let store = Arc::new(MemoryBlobStore::new());
    let orchestrator = PipelineOrchestrator::new(services(rpc.clone(), prices.clone(), store.clone()), options());

    let err = orchestrator.load_input().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::MissingInput));

    let err = orchestrator.run_and_store(&InputConfig::default()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::MissingInput));

    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 0);
    assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
    assert!(store.slot_names().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_price_succeeds_on_retry() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S1"])
            .with_transaction("S1", "MintA"),
    );
    let prices = Arc::new(FakePrices::default().script(
        "MintA",
        vec![Err(FetchError::rate_limited("HTTP 429")), Ok(quote(3.25, "PoolA"))],
    ));
    let orchestrator = PipelineOrchestrator::new(
        services(rpc, prices.clone(), Arc::new(MemoryBlobStore::new())),
        options(),
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();

    assert_eq!(prices.calls.load(Ordering::SeqCst), 2);
    assert_eq!(output.partitioned.valid.len(), 1);
    assert_eq!(output.partitioned.valid[0].price, Some(3.25));

    // The rate-limited key cools down, so the retry leases the other one
    let keys = prices.keys_seen.lock().unwrap().clone();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_price_becomes_null_record() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S1"])
            .with_transaction("S1", "MintA"),
    );
    let prices = Arc::new(FakePrices::default().script(
        "MintA",
        vec![Err(FetchError::ServerError("HTTP 503".to_string()))],
    ));
    let orchestrator = PipelineOrchestrator::new(
        services(rpc, prices.clone(), Arc::new(MemoryBlobStore::new())),
        options(),
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();

    assert_eq!(prices.calls.load(Ordering::SeqCst), 3);
    assert!(output.partitioned.valid.is_empty());
    assert_eq!(output.partitioned.null.len(), 1);
    assert!(output.partitioned.null[0].error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_signature_paging_and_cap() {
    let wallet = ["A", "B", "C", "D", "E"];

    let rpc = Arc::new(FakeRpc::default().with_wallet("W1", &wallet));
    let mut paged = options();
    paged.signature_page_limit = 2;
    paged.max_signatures = 0;
    let orchestrator = PipelineOrchestrator::new(
        services(rpc.clone(), Arc::new(FakePrices::default()), Arc::new(MemoryBlobStore::new())),
        paged.clone(),
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();
    let listed: Vec<&str> = output.signatures.iter().map(|s| s.signature.as_str()).collect();
    assert_eq!(listed, wallet);
    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 3);

    let rpc = Arc::new(FakeRpc::default().with_wallet("W1", &wallet));
    paged.max_signatures = 3;
    let orchestrator = PipelineOrchestrator::new(
        services(rpc.clone(), Arc::new(FakePrices::default()), Arc::new(MemoryBlobStore::new())),
        paged,
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();
    let listed: Vec<&str> = output.signatures.iter().map(|s| s.signature.as_str()).collect();
    assert_eq!(listed, ["A", "B", "C"]);
    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 2);
    // Unknown transactions are skipped rather than failing the run
    assert!(output.raw_transactions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_slot_does_not_stop_other_saves() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S1"])
            .with_transaction("S1", "MintA"),
    );
    let prices = Arc::new(FakePrices::default().script("MintA", vec![Ok(quote(1.0, "PoolA"))]));
    let store = Arc::new(FlakyStore {
        inner: MemoryBlobStore::new(),
        refused: slots::SIGNATURES,
        attempted: Mutex::new(Vec::new()),
    });
    let orchestrator = PipelineOrchestrator::new(services(rpc, prices, store.clone()), options());

    let input = InputConfig {
        wallet_address: Some("W1".to_string()),
        wallet_addresses: None,
    };
    let err = orchestrator.run_and_store(&input).await.unwrap_err();

    match err {
        OrchestratorError::Persistence(message) => assert!(message.starts_with(slots::SIGNATURES)),
        other => panic!("expected persistence error, got {:?}", other),
    }
    assert_eq!(
        *store.attempted.lock().unwrap(),
        vec![
            slots::SIGNATURES,
            slots::RAW_TRANSACTIONS,
            slots::ENHANCED_OUTPUT,
            slots::PRICES_VALID,
            slots::PRICES_NULL,
        ]
    );
    assert!(store.inner.load(slots::PRICES_VALID).await.unwrap().is_some());
    assert!(store.inner.load(slots::SIGNATURES).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_page_keeps_earlier_signatures() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["A", "B", "C", "D", "E", "F"])
            .fail_page_after("D"),
    );
    let mut paged = options();
    paged.signature_page_limit = 4;
    paged.max_signatures = 0;
    let orchestrator = PipelineOrchestrator::new(
        services(rpc.clone(), Arc::new(FakePrices::default()), Arc::new(MemoryBlobStore::new())),
        paged,
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();

    let listed: Vec<&str> = output.signatures.iter().map(|s| s.signature.as_str()).collect();
    assert_eq!(listed, ["A", "B", "C", "D"]);
    // Terminal errors are not retried
    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_transaction_skipped_rest_of_batch_kept() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["S0", "S1", "S2", "S3"])
            .with_transaction("S0", "Mint0")
            .with_transaction("S1", "Mint1")
            .with_transaction("S2", "Mint2")
            .with_transaction("S3", "Mint3")
            .fail_transaction("S0"),
    );
    let prices = Arc::new(
        FakePrices::default()
            .script("Mint1", vec![Ok(quote(1.0, "Pool1"))])
            .script("Mint2", vec![Ok(quote(2.0, "Pool2"))])
            .script("Mint3", vec![Ok(quote(3.0, "Pool3"))]),
    );
    let orchestrator = PipelineOrchestrator::new(
        services(rpc.clone(), prices, Arc::new(MemoryBlobStore::new())),
        options(),
    );

    let output = orchestrator.run(&["W1".to_string()]).await.unwrap();

    assert_eq!(rpc.transaction_calls_for("S0"), 1);
    assert_eq!(output.stats.transactions, 3);
    assert_eq!(output.stats.valid_prices, 3);
    let enhanced: Vec<&str> = output.enhanced.iter().map(|r| r.signature.as_str()).collect();
    assert_eq!(enhanced, ["S1", "S2", "S3"]);
}

#[tokio::test(start_paused = true)]
async fn test_signature_stage_batch_keeps_wallet_order_and_caches() {
    let rpc = Arc::new(
        FakeRpc::default()
            .with_wallet("W1", &["A", "B"])
            .with_wallet("W2", &["C"]),
    );
    let stage = SignatureStage::new(
        rpc.clone(),
        pool("signature-proxies", ResourceKind::Proxy, &[DIRECT_EGRESS]),
        RetryController::new(options().retry),
        1000,
        0,
    );

    let records = stage.fetch_batch(&["W1".to_string(), "W2".to_string()]).await;
    let listed: Vec<&str> = records.iter().map(|s| s.signature.as_str()).collect();
    assert_eq!(listed, ["A", "B", "C"]);
    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 2);

    let again = stage.fetch_batch(&["W2".to_string()]).await;
    assert_eq!(again.len(), 1);
    assert_eq!(rpc.signature_calls.load(Ordering::SeqCst), 2);
}
