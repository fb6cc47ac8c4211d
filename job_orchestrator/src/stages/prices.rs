use super::cache::RunCache;
use futures::future::join_all;
use history_core::{EnhancedRecord, PriceRecord};
use jprice_client::PriceFetcher;
use resource_manager::KeyedEgress;
use retry_utils::RetryController;
use std::sync::Arc;
use tracing::{debug, info};

/// Looks up the historical price of each record's mint at its block time.
///
/// Every attempt leases an API key and a proxy. Failures become null-price
/// records instead of errors.
pub struct PriceStage {
    fetcher: Arc<dyn PriceFetcher>,
    egress: KeyedEgress,
    retry: RetryController,
    batch_size: usize,
    cache: RunCache<PriceRecord>,
}

impl PriceStage {
    /// `batch_size` of `None` sizes batches to the number of API keys
    pub fn new(
        fetcher: Arc<dyn PriceFetcher>,
        egress: KeyedEgress,
        retry: RetryController,
        batch_size: Option<usize>,
    ) -> Self {
        let batch_size = batch_size.unwrap_or_else(|| egress.api_keys().len()).max(1);
        Self {
            fetcher,
            egress,
            retry,
            batch_size,
            cache: RunCache::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn fetch_batch(&self, records: &[EnhancedRecord]) -> Vec<PriceRecord> {
        let mut prices = Vec::with_capacity(records.len());

        for batch in records.chunks(self.batch_size) {
            let results = join_all(batch.iter().map(|record| self.fetch_one(record))).await;
            prices.extend(results);
        }

        let valid = prices.iter().filter(|price| price.is_valid()).count();
        info!("💰 Priced {} records: {} valid, {} without price", prices.len(), valid, prices.len() - valid);
        prices
    }

    async fn fetch_one(&self, record: &EnhancedRecord) -> PriceRecord {
        let key = record.price_key();
        if let Some(cached) = self.cache.get(&key).await {
            debug!("Price cache hit for {}", key);
            return cached;
        }

        let mint = record.mint.as_str();
        let timestamp_ms = record.timestamp;
        let label = format!("price({} @ {})", mint, timestamp_ms);

        let result = self
            .retry
            .execute(&self.egress, &label, |lease| {
                let fetcher = &self.fetcher;
                async move {
                    fetcher
                        .fetch_price(mint, timestamp_ms, &lease.api_key, &lease.proxy)
                        .await
                }
            })
            .await;

        let price = match result {
            Ok(quote) => quote.into_record(mint, record.block_time),
            Err(e) => PriceRecord::failed(mint, record.block_time, e.to_string()),
        };

        self.cache.insert(key, price.clone()).await;
        price
    }
}
