// Reduces fetched transactions to the token mint they touched

use history_core::{EnhancedRecord, FetchedTransaction, RawTransaction, TokenBalance};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Wrapped SOL, never reported as a traded token
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Transaction {0} has no token balances with a mint")]
    NoMint(String),
    #[error("Transaction {signature} only touches excluded mint {mint}")]
    ExcludedMint { signature: String, mint: String },
    #[error("Transaction {0} has no block time")]
    MissingBlockTime(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Configuration for transaction parsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    pub excluded_mints: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            excluded_mints: vec![WRAPPED_SOL_MINT.to_string()],
        }
    }
}

pub struct TransactionParser {
    config: ParserConfig,
}

impl TransactionParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    /// First pre-balance mint, else first post-balance mint
    pub fn extract_mint(tx: &RawTransaction) -> Option<&str> {
        fn first_mint(balances: &[TokenBalance]) -> Option<&str> {
            balances
                .first()
                .and_then(|balance| balance.mint.as_deref())
                .filter(|mint| !mint.is_empty())
        }

        first_mint(tx.pre_token_balances()).or_else(|| first_mint(tx.post_token_balances()))
    }

    pub fn is_excluded(&self, mint: &str) -> bool {
        self.config.excluded_mints.iter().any(|excluded| excluded == mint)
    }

    pub fn enhance(&self, fetched: &FetchedTransaction) -> Result<EnhancedRecord> {
        let signature = &fetched.signature.signature;

        let mint = Self::extract_mint(&fetched.transaction)
            .ok_or_else(|| ParseError::NoMint(signature.clone()))?;

        if self.is_excluded(mint) {
            return Err(ParseError::ExcludedMint {
                signature: signature.clone(),
                mint: mint.to_string(),
            });
        }

        let block_time = fetched
            .block_time()
            .ok_or_else(|| ParseError::MissingBlockTime(signature.clone()))?;

        Ok(EnhancedRecord::new(signature.clone(), mint, block_time))
    }

    /// Enhance every transaction, dropping the ones without a usable mint
    pub fn enhance_all(&self, fetched: &[FetchedTransaction]) -> Vec<EnhancedRecord> {
        let enhanced: Vec<EnhancedRecord> = fetched
            .iter()
            .filter_map(|tx| match self.enhance(tx) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping transaction: {}", e);
                    None
                }
            })
            .collect();

        debug!(
            "Parsed {} of {} transactions into mint records",
            enhanced.len(),
            fetched.len()
        );
        enhanced
    }
}

impl Default for TransactionParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}
