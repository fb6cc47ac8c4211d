use config_manager::{InputConfig, LaneLimits, SystemConfig};
use futures::future::join_all;
use history_core::{partition, EnhancedRecord, PartitionedPrices, PriceRecord, RawTransaction, SignatureRecord};
use jprice_client::{PriceClientConfig, PriceFetcher, PriceHistoryClient};
use persistence_layer::{load_json, save_json, BlobStore, PersistenceError};
use resource_manager::{
    EgressClients, KeyedEgress, PoolConfig, PoolError, RateLimiter, RateLimiterConfig, ResourceKind, ResourcePool,
    DIRECT_EGRESS,
};
use retry_utils::{RetryConfig, RetryController};
use serde::{Deserialize, Serialize};
use solana_client::{RpcFetcher, SolanaClient, SolanaClientConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};
use tx_parser::TransactionParser;
use uuid::Uuid;

pub mod stages;
pub use stages::{PriceStage, SignatureStage, TransactionStage};

/// Blob slot names
pub mod slots {
    pub const INPUT: &str = "input";
    pub const SIGNATURES: &str = "signatures";
    pub const RAW_TRANSACTIONS: &str = "rawTransactions";
    pub const ENHANCED_OUTPUT: &str = "enhancedOutput";
    pub const PRICES_VALID: &str = "prices-valid";
    pub const PRICES_NULL: &str = "prices-null";
}

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("No walletAddress or walletAddresses found in input")]
    MissingInput,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Resource pool error: {0}")]
    Pool(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<PersistenceError> for OrchestratorError {
    fn from(err: PersistenceError) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<PoolError> for OrchestratorError {
    fn from(err: PoolError) -> Self {
        OrchestratorError::Pool(err.to_string())
    }
}

impl From<config_manager::ConfigurationError> for OrchestratorError {
    fn from(err: config_manager::ConfigurationError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Long-lived collaborators shared by every run
#[derive(Clone)]
pub struct PipelineServices {
    pub rpc: Arc<dyn RpcFetcher>,
    pub prices: Arc<dyn PriceFetcher>,
    pub store: Arc<dyn BlobStore>,
    pub signature_proxies: Arc<ResourcePool>,
    pub transaction_proxies: Arc<ResourcePool>,
    pub price_egress: KeyedEgress,
    pub signature_limiter: Arc<RateLimiter>,
    pub transaction_limiter: Arc<RateLimiter>,
    pub price_limiter: Arc<RateLimiter>,
    pub wallet_limiter: Arc<RateLimiter>,
}

/// Tunables of a run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub retry: RetryConfig,
    pub signature_page_limit: u32,
    /// 0 for no limit
    pub max_signatures: usize,
    pub transaction_batch_size: usize,
    /// `None` sizes price batches to the number of API keys
    pub price_batch_size: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            signature_page_limit: 1000,
            max_signatures: 1000,
            transaction_batch_size: 10,
            price_batch_size: None,
        }
    }
}

/// Counts per stage for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub run_id: String,
    pub wallets: usize,
    pub signatures: usize,
    pub transactions: usize,
    pub enhanced: usize,
    pub price_lookups: usize,
    pub valid_prices: usize,
    pub null_prices: usize,
    pub elapsed_ms: u64,
}

/// Everything a run produced, all wallets concatenated in input order
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub signatures: Vec<SignatureRecord>,
    pub raw_transactions: Vec<RawTransaction>,
    pub enhanced: Vec<EnhancedRecord>,
    pub prices: Vec<PriceRecord>,
    pub partitioned: PartitionedPrices,
    pub stats: PipelineStats,
}

#[derive(Default)]
struct WalletOutput {
    signatures: Vec<SignatureRecord>,
    raw_transactions: Vec<RawTransaction>,
    enhanced: Vec<EnhancedRecord>,
    prices: Vec<PriceRecord>,
}

/// Stages built for one run, sharing the long-lived limiters and pools
struct RunStages {
    signatures: SignatureStage,
    transactions: TransactionStage,
    prices: PriceStage,
}

/// Drives wallets through signatures, transactions, mint parsing and prices
pub struct PipelineOrchestrator {
    services: PipelineServices,
    options: PipelineOptions,
    parser: TransactionParser,
}

fn lane_limiter(name: &str, limits: &LaneLimits) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        name,
        RateLimiterConfig {
            reservoir_max: Some(limits.reservoir),
            refresh_interval: Duration::from_millis(limits.refresh_interval_ms),
            max_concurrent: limits.max_concurrent,
            min_spacing: Duration::from_millis(limits.min_spacing_ms),
        },
    ))
}

fn proxy_pool(name: &str, proxies: &[String], config: PoolConfig) -> Result<Arc<ResourcePool>> {
    let pool = if proxies.is_empty() {
        ResourcePool::new(name, ResourceKind::Proxy, [DIRECT_EGRESS], config)?
    } else {
        ResourcePool::new(name, ResourceKind::Proxy, proxies, config)?
    };
    Ok(Arc::new(pool))
}

impl PipelineOrchestrator {
    pub fn new(services: PipelineServices, options: PipelineOptions) -> Self {
        Self {
            services,
            options,
            parser: TransactionParser::default(),
        }
    }

    /// Wire the real RPC and price clients, pools and limiters from configuration
    pub fn from_system_config(config: &SystemConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        config.validate()?;

        let pool_config = PoolConfig {
            base_cooldown: Duration::from_millis(config.pools.base_cooldown_ms),
            success_cooldown: Duration::from_millis(config.pools.success_cooldown_ms),
            max_failures: config.pools.max_failures,
            check_interval: Duration::from_millis(config.pools.check_interval_ms),
        };

        let rpc_egress = Arc::new(EgressClients::new(Duration::from_secs(config.solana.rpc_timeout_seconds)));
        let price_http = Arc::new(EgressClients::new(Duration::from_secs(
            config.price_api.request_timeout_seconds,
        )));

        let rpc = SolanaClient::new(
            SolanaClientConfig {
                rpc_url: config.solana.rpc_url.clone(),
                rpc_timeout_seconds: config.solana.rpc_timeout_seconds,
            },
            rpc_egress,
        );
        let prices = PriceHistoryClient::new(
            PriceClientConfig {
                api_url: config.price_api.api_url.clone(),
                request_timeout_seconds: config.price_api.request_timeout_seconds,
            },
            price_http,
        );

        let api_keys = Arc::new(ResourcePool::new(
            "price-api-keys",
            ResourceKind::ApiKey,
            &config.price_api.api_keys,
            pool_config.clone(),
        )?);

        let services = PipelineServices {
            rpc: Arc::new(rpc),
            prices: Arc::new(prices),
            store,
            signature_proxies: proxy_pool("signature-proxies", &config.proxies.signature, pool_config.clone())?,
            transaction_proxies: proxy_pool("transaction-proxies", &config.proxies.transaction, pool_config.clone())?,
            price_egress: KeyedEgress::new(
                api_keys,
                proxy_pool("price-proxies", &config.proxies.price, pool_config)?,
            ),
            signature_limiter: lane_limiter("signatures", &config.limits.signatures),
            transaction_limiter: lane_limiter("transactions", &config.limits.transactions),
            price_limiter: lane_limiter("prices", &config.limits.prices),
            wallet_limiter: Arc::new(RateLimiter::new(
                "wallets",
                RateLimiterConfig::concurrency_only(
                    config.limits.wallets.max_concurrent,
                    Duration::from_millis(config.limits.wallets.min_spacing_ms),
                ),
            )),
        };

        let options = PipelineOptions {
            retry: RetryConfig {
                max_attempts: config.retry.max_attempts,
                base_delay: Duration::from_millis(config.retry.base_delay_ms),
                call_timeout: Duration::from_secs(config.retry.call_timeout_seconds),
            },
            signature_page_limit: config.solana.signature_page_limit,
            max_signatures: config.solana.max_signatures,
            transaction_batch_size: config.pipeline.transaction_batch_size,
            price_batch_size: match config.pipeline.price_batch_size {
                0 => None,
                size => Some(size),
            },
        };

        Ok(Self::new(services, options))
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Wallets named by the input slot, or `MissingInput`
    pub fn resolve_wallets(input: &InputConfig) -> Result<Vec<String>> {
        let wallets = input.wallet_list();
        if wallets.is_empty() {
            return Err(OrchestratorError::MissingInput);
        }
        Ok(wallets)
    }

    /// Read the `input` slot; an absent slot counts as missing input
    pub async fn load_input(&self) -> Result<InputConfig> {
        load_json::<InputConfig, _>(self.services.store.as_ref(), slots::INPUT)
            .await?
            .ok_or(OrchestratorError::MissingInput)
    }

    fn build_stages(&self) -> RunStages {
        let retry = |limiter: &Arc<RateLimiter>| {
            RetryController::new(self.options.retry.clone()).with_limiter(limiter.clone())
        };

        RunStages {
            signatures: SignatureStage::new(
                self.services.rpc.clone(),
                self.services.signature_proxies.clone(),
                retry(&self.services.signature_limiter),
                self.options.signature_page_limit,
                self.options.max_signatures,
            ),
            transactions: TransactionStage::new(
                self.services.rpc.clone(),
                self.services.transaction_proxies.clone(),
                retry(&self.services.transaction_limiter),
                self.options.transaction_batch_size,
            ),
            prices: PriceStage::new(
                self.services.prices.clone(),
                self.services.price_egress.clone(),
                retry(&self.services.price_limiter),
                self.options.price_batch_size,
            ),
        }
    }

    /// Run every wallet through the pipeline; caches live for this call only
    pub async fn run(&self, wallets: &[String]) -> Result<PipelineOutput> {
        if wallets.is_empty() {
            return Err(OrchestratorError::MissingInput);
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, wallets).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, wallets: &[String]) -> Result<PipelineOutput> {
        let started = Instant::now();
        info!("🚀 Starting pipeline run for {} wallet(s)", wallets.len());

        let stages = self.build_stages();

        let wallet_runs = wallets.iter().map(|wallet| {
            let stages = &stages;
            async move {
                let _permit = self.services.wallet_limiter.acquire().await;
                self.process_wallet(stages, wallet).await
            }
        });
        let per_wallet = join_all(wallet_runs).await;

        let mut output = PipelineOutput::default();
        for wallet_output in per_wallet {
            output.signatures.extend(wallet_output.signatures);
            output.raw_transactions.extend(wallet_output.raw_transactions);
            output.enhanced.extend(wallet_output.enhanced);
            output.prices.extend(wallet_output.prices);
        }

        output.partitioned = partition(output.prices.iter().cloned());
        output.stats = PipelineStats {
            run_id: run_id.to_string(),
            wallets: wallets.len(),
            signatures: output.signatures.len(),
            transactions: output.raw_transactions.len(),
            enhanced: output.enhanced.len(),
            price_lookups: output.prices.len(),
            valid_prices: output.partitioned.valid.len(),
            null_prices: output.partitioned.null.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "✅ Pipeline run complete: {} signatures, {} transactions, {} enhanced, {} valid / {} null prices in {}ms",
            output.stats.signatures,
            output.stats.transactions,
            output.stats.enhanced,
            output.stats.valid_prices,
            output.stats.null_prices,
            output.stats.elapsed_ms
        );

        Ok(output)
    }

    async fn process_wallet(&self, stages: &RunStages, wallet: &str) -> WalletOutput {
        info!("Processing wallet address: {}", wallet);

        let signatures = stages.signatures.fetch_wallet(wallet).await;
        if signatures.is_empty() {
            debug!("No signatures for wallet {}", wallet);
            return WalletOutput::default();
        }

        let fetched = stages.transactions.fetch_batch(&signatures).await;
        let enhanced = self.parser.enhance_all(&fetched);
        let prices = stages.prices.fetch_batch(&enhanced).await;

        debug!(
            "Wallet {}: {} signatures, {} transactions, {} enhanced, {} prices",
            wallet,
            signatures.len(),
            fetched.len(),
            enhanced.len(),
            prices.len()
        );

        WalletOutput {
            signatures,
            raw_transactions: fetched.into_iter().map(|tx| tx.transaction).collect(),
            enhanced,
            prices,
        }
    }

    /// Resolve wallets, run, and persist every output slot
    pub async fn run_and_store(&self, input: &InputConfig) -> Result<PipelineOutput> {
        let wallets = Self::resolve_wallets(input)?;
        let output = self.run(&wallets).await?;
        self.store_output(&output).await?;
        Ok(output)
    }

    /// Save all slots; every slot is attempted before a failure is reported
    pub async fn store_output(&self, output: &PipelineOutput) -> Result<()> {
        let store = self.services.store.as_ref();
        let saves = [
            (slots::SIGNATURES, save_json(store, slots::SIGNATURES, &output.signatures).await),
            (
                slots::RAW_TRANSACTIONS,
                save_json(store, slots::RAW_TRANSACTIONS, &output.raw_transactions).await,
            ),
            (
                slots::ENHANCED_OUTPUT,
                save_json(store, slots::ENHANCED_OUTPUT, &output.enhanced).await,
            ),
            (
                slots::PRICES_VALID,
                save_json(store, slots::PRICES_VALID, &output.partitioned.valid).await,
            ),
            (
                slots::PRICES_NULL,
                save_json(store, slots::PRICES_NULL, &output.partitioned.null).await,
            ),
        ];

        let failures: Vec<String> = saves
            .into_iter()
            .filter_map(|(slot, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    error!("❌ Failed to save slot {}: {}", slot, e);
                    Some(format!("{}: {}", slot, e))
                }
            })
            .collect();

        if !failures.is_empty() {
            return Err(OrchestratorError::Persistence(failures.join("; ")));
        }

        info!(
            "Found {} null prices and {} valid prices",
            output.partitioned.null.len(),
            output.partitioned.valid.len()
        );
        Ok(())
    }
}
