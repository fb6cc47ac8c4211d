use super::cache::RunCache;
use futures::future::join_all;
use history_core::{FetchedTransaction, RawTransaction, SignatureRecord};
use resource_manager::ResourcePool;
use retry_utils::RetryController;
use solana_client::RpcFetcher;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fetches full transactions for signatures, one batch at a time
pub struct TransactionStage {
    fetcher: Arc<dyn RpcFetcher>,
    proxies: Arc<ResourcePool>,
    retry: RetryController,
    batch_size: usize,
    /// `None` records a transaction the node does not know
    cache: RunCache<Option<RawTransaction>>,
}

impl TransactionStage {
    pub fn new(
        fetcher: Arc<dyn RpcFetcher>,
        proxies: Arc<ResourcePool>,
        retry: RetryController,
        batch_size: usize,
    ) -> Self {
        Self {
            fetcher,
            proxies,
            retry,
            batch_size: batch_size.max(1),
            cache: RunCache::new(),
        }
    }

    /// Transactions for `signatures` in input order; unknown and failed ones are skipped
    pub async fn fetch_batch(&self, signatures: &[SignatureRecord]) -> Vec<FetchedTransaction> {
        let mut fetched = Vec::with_capacity(signatures.len());

        for (batch_index, batch) in signatures.chunks(self.batch_size).enumerate() {
            debug!(
                "Fetching transaction batch {} ({} signatures)",
                batch_index + 1,
                batch.len()
            );

            let results = join_all(batch.iter().map(|record| self.fetch_one(record))).await;
            fetched.extend(results.into_iter().flatten());
        }

        info!("🔍 Fetched {}/{} transactions", fetched.len(), signatures.len());
        fetched
    }

    async fn fetch_one(&self, record: &SignatureRecord) -> Option<FetchedTransaction> {
        let signature = record.signature.as_str();

        let transaction = match self.cache.get(signature).await {
            Some(cached) => {
                debug!("Transaction cache hit for {}", signature);
                cached
            }
            None => {
                let label = format!("getTransaction({})", signature);
                let result = self
                    .retry
                    .execute(self.proxies.as_ref(), &label, |proxy| {
                        let fetcher = &self.fetcher;
                        async move { fetcher.get_transaction(signature, &proxy).await }
                    })
                    .await;

                match result {
                    Ok(transaction) => {
                        self.cache.insert(signature, transaction.clone()).await;
                        transaction
                    }
                    Err(e) => {
                        warn!("Skipping transaction {}: {}", signature, e);
                        return None;
                    }
                }
            }
        };

        match transaction {
            Some(transaction) => Some(FetchedTransaction {
                signature: record.clone(),
                transaction,
            }),
            None => {
                warn!("Transaction {} not found, skipping", signature);
                None
            }
        }
    }
}
