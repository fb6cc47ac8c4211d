use super::cache::RunCache;
use futures::future::join_all;
use history_core::SignatureRecord;
use resource_manager::ResourcePool;
use retry_utils::RetryController;
use solana_client::RpcFetcher;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lists each wallet's transaction signatures, newest first, page by page
pub struct SignatureStage {
    fetcher: Arc<dyn RpcFetcher>,
    proxies: Arc<ResourcePool>,
    retry: RetryController,
    page_limit: u32,
    max_signatures: usize,
    cache: RunCache<Vec<SignatureRecord>>,
}

impl SignatureStage {
    pub fn new(
        fetcher: Arc<dyn RpcFetcher>,
        proxies: Arc<ResourcePool>,
        retry: RetryController,
        page_limit: u32,
        max_signatures: usize,
    ) -> Self {
        Self {
            fetcher,
            proxies,
            retry,
            page_limit: page_limit.max(1),
            max_signatures,
            cache: RunCache::new(),
        }
    }

    /// Signatures of every wallet, wallets fetched concurrently, results in input order
    pub async fn fetch_batch(&self, addresses: &[String]) -> Vec<SignatureRecord> {
        let per_wallet = join_all(addresses.iter().map(|address| self.fetch_wallet(address))).await;
        per_wallet.into_iter().flatten().collect()
    }

    pub async fn fetch_wallet(&self, address: &str) -> Vec<SignatureRecord> {
        if let Some(cached) = self.cache.get(address).await {
            debug!("Signature cache hit for wallet {}", address);
            return cached;
        }

        let mut collected: Vec<SignatureRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut before: Option<String> = None;

        loop {
            let limit = match self.max_signatures {
                0 => self.page_limit,
                max => self
                    .page_limit
                    .min(u32::try_from(max - collected.len()).unwrap_or(u32::MAX)),
            };

            let label = format!("getSignaturesForAddress({})", address);
            let page = self
                .retry
                .execute(self.proxies.as_ref(), &label, |proxy| {
                    let fetcher = &self.fetcher;
                    let before = before.clone();
                    async move {
                        fetcher
                            .get_signatures_for_address(address, limit, before.as_deref(), &proxy)
                            .await
                    }
                })
                .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        "Signature listing for {} stopped after {} signatures: {}",
                        address,
                        collected.len(),
                        e
                    );
                    break;
                }
            };

            let page_len = page.len();
            let last_signature = page.last().map(|record| record.signature.clone());

            for record in page {
                if seen.insert(record.signature.clone()) {
                    collected.push(record);
                }
            }

            if self.max_signatures > 0 && collected.len() >= self.max_signatures {
                collected.truncate(self.max_signatures);
                debug!("Wallet {} truncated to {} signatures", address, self.max_signatures);
                break;
            }

            // A short page is the last one
            if page_len < limit as usize {
                break;
            }

            match last_signature {
                Some(signature) if before.as_deref() != Some(signature.as_str()) => before = Some(signature),
                _ => break,
            }
        }

        info!("📜 Found {} signatures for wallet {}", collected.len(), address);
        self.cache.insert(address, collected.clone()).await;
        collected
    }
}
