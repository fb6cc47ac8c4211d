use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Comma separated price API keys, read when none are configured
pub const API_KEY_FALLBACK_ENV: &str = "SOLANA_TRACKER_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ConfigError),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// General system settings
    pub system: SystemSettings,

    /// Solana RPC endpoint and signature paging
    pub solana: SolanaConfig,

    /// Historical price API
    pub price_api: PriceApiConfig,

    /// Egress proxies per request lane
    pub proxies: ProxyConfig,

    /// Rate limits per request lane
    pub limits: LimitsConfig,

    /// Proxy / API key rotation
    pub pools: PoolSettings,

    pub retry: RetrySettings,

    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Directory holding the JSON slots (`input.json`, `prices-valid.json`, ...)
    pub data_dir: String,

    /// Enable debug mode
    pub debug_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolanaConfig {
    pub rpc_url: String,

    /// Request timeout in seconds
    pub rpc_timeout_seconds: u64,

    /// Signatures requested per `getSignaturesForAddress` page
    pub signature_page_limit: u32,

    /// Max signatures per wallet, 0 for no limit
    pub max_signatures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceApiConfig {
    pub api_url: String,

    /// Keys rotated across price requests
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Request timeout in seconds
    pub request_timeout_seconds: u64,
}

/// Proxy URLs per lane; an empty list means direct connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub signature: Vec<String>,
    #[serde(default)]
    pub transaction: Vec<String>,
    #[serde(default)]
    pub price: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneLimits {
    /// Requests per refresh interval
    pub reservoir: u32,
    pub refresh_interval_ms: u64,
    pub max_concurrent: usize,
    pub min_spacing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletLimits {
    /// Wallets processed at the same time
    pub max_concurrent: usize,
    /// Minimum delay between two wallet starts
    pub min_spacing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub signatures: LaneLimits,
    pub transactions: LaneLimits,
    pub prices: LaneLimits,
    pub wallets: WalletLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Cooldown after the k-th consecutive failure is `base_cooldown_ms * 2^k`
    pub base_cooldown_ms: u64,
    /// Rest period after a successful request
    pub success_cooldown_ms: u64,
    /// Consecutive failures before a resource is quarantined
    pub max_failures: u32,
    /// Shortest sleep while waiting for a resource
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts per request
    pub max_attempts: u32,
    /// Flat delay between attempts
    pub base_delay_ms: u64,
    /// Upper bound for one attempt, in seconds
    pub call_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Transactions fetched in parallel per batch
    pub transaction_batch_size: usize,
    /// Price lookups per batch, 0 to use the number of API keys
    pub price_batch_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings {
                data_dir: "data".to_string(),
                debug_mode: false,
            },
            solana: SolanaConfig {
                rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
                rpc_timeout_seconds: 30,
                signature_page_limit: 1000,
                max_signatures: 1000,
            },
            price_api: PriceApiConfig {
                api_url: "https://data.solanatracker.io".to_string(),
                api_keys: Vec::new(), // Must be set in config or SOLANA_TRACKER_API_KEY
                request_timeout_seconds: 30,
            },
            proxies: ProxyConfig::default(),
            limits: LimitsConfig {
                signatures: LaneLimits {
                    reservoir: 100,
                    refresh_interval_ms: 10_000,
                    max_concurrent: 100,
                    min_spacing_ms: 0,
                },
                transactions: LaneLimits {
                    reservoir: 100,
                    refresh_interval_ms: 11_000,
                    max_concurrent: 100,
                    min_spacing_ms: 0,
                },
                prices: LaneLimits {
                    reservoir: 100,
                    refresh_interval_ms: 10_000,
                    max_concurrent: 50,
                    min_spacing_ms: 0,
                },
                wallets: WalletLimits {
                    max_concurrent: 5,
                    min_spacing_ms: 1000,
                },
            },
            pools: PoolSettings {
                base_cooldown_ms: 3000,
                success_cooldown_ms: 3000,
                max_failures: 3,
                check_interval_ms: 250,
            },
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1000,
                call_timeout_seconds: 30,
            },
            pipeline: PipelineSettings {
                transaction_batch_size: 10,
                price_batch_size: 0,
            },
        }
    }
}

impl LaneLimits {
    fn validate(&self, lane: &str) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigurationError::InvalidValue(format!(
                "limits.{}.max_concurrent cannot be 0",
                lane
            )));
        }
        if self.reservoir == 0 || self.refresh_interval_ms == 0 {
            return Err(ConfigurationError::InvalidValue(format!(
                "limits.{} needs a non-zero reservoir and refresh interval",
                lane
            )));
        }
        Ok(())
    }
}

impl SystemConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config_builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&SystemConfig::default())?);

        if config_path.as_ref().exists() {
            info!(
                "Loading configuration from: {}",
                config_path.as_ref().display()
            );
            config_builder = config_builder.add_source(File::from(config_path.as_ref()));
        } else {
            debug!("Config file not found, using defaults and environment variables");
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("WPT")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("price_api.api_keys")
                .with_list_parse_key("proxies.signature")
                .with_list_parse_key("proxies.transaction")
                .with_list_parse_key("proxies.price"),
        );

        let mut system_config: SystemConfig = config_builder.build()?.try_deserialize()?;

        system_config.apply_api_key_fallback(std::env::var(API_KEY_FALLBACK_ENV).ok());
        system_config.normalize_lists();

        system_config.validate()?;

        Ok(system_config)
    }

    /// Use `fallback` (comma separated) when no API keys are configured
    pub fn apply_api_key_fallback(&mut self, fallback: Option<String>) {
        if !self.price_api.api_keys.is_empty() {
            return;
        }
        if let Some(keys) = fallback {
            self.price_api.api_keys = split_list(&keys);
            if !self.price_api.api_keys.is_empty() {
                info!(
                    "Using {} price API key(s) from {}",
                    self.price_api.api_keys.len(),
                    API_KEY_FALLBACK_ENV
                );
            }
        }
    }

    /// Trim entries and drop blanks from the key and proxy lists
    pub fn normalize_lists(&mut self) {
        for list in [
            &mut self.price_api.api_keys,
            &mut self.proxies.signature,
            &mut self.proxies.transaction,
            &mut self.proxies.price,
        ] {
            let before = list.len();
            *list = list
                .iter()
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect();
            if list.len() != before {
                warn!("Dropped {} blank list entries from configuration", before - list.len());
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.price_api.api_keys.is_empty() {
            return Err(ConfigurationError::InvalidValue(format!(
                "At least one price API key is required (price_api.api_keys or {})",
                API_KEY_FALLBACK_ENV
            )));
        }

        if self.solana.rpc_timeout_seconds == 0
            || self.price_api.request_timeout_seconds == 0
            || self.retry.call_timeout_seconds == 0
        {
            return Err(ConfigurationError::InvalidValue(
                "Timeouts cannot be 0".to_string(),
            ));
        }

        if self.solana.signature_page_limit == 0 {
            return Err(ConfigurationError::InvalidValue(
                "solana.signature_page_limit cannot be 0".to_string(),
            ));
        }

        self.limits.signatures.validate("signatures")?;
        self.limits.transactions.validate("transactions")?;
        self.limits.prices.validate("prices")?;

        if self.limits.wallets.max_concurrent == 0 {
            return Err(ConfigurationError::InvalidValue(
                "limits.wallets.max_concurrent cannot be 0".to_string(),
            ));
        }

        if self.pools.max_failures == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pools.max_failures cannot be 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::InvalidValue(
                "retry.max_attempts cannot be 0".to_string(),
            ));
        }

        if self.pipeline.transaction_batch_size == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.transaction_batch_size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get configuration as a JSON value for logging, keys masked
    pub fn to_json_value(&self) -> serde_json::Value {
        let mut masked = self.clone();
        masked.price_api.api_keys = masked
            .price_api
            .api_keys
            .iter()
            .map(|key| format!("{}...", key.chars().take(8).collect::<String>()))
            .collect();
        serde_json::to_value(&masked).unwrap_or(serde_json::Value::Null)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Contents of the `input` slot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_addresses: Option<Vec<String>>,
}

impl InputConfig {
    /// Wallets to process: the list wins over the single address, entries are
    /// trimmed, blanks and repeats dropped, order kept
    pub fn wallet_list(&self) -> Vec<String> {
        let candidates: Vec<&str> = match (&self.wallet_addresses, &self.wallet_address) {
            (Some(list), _) if !list.is_empty() => list.iter().map(String::as_str).collect(),
            (_, Some(single)) => vec![single.as_str()],
            _ => Vec::new(),
        };

        let mut wallets: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() && !wallets.iter().any(|w| w == trimmed) {
                wallets.push(trimmed.to_string());
            }
        }
        wallets
    }
}
