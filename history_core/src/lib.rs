pub mod aggregator;
pub mod records;

pub use aggregator::{partition, PartitionedPrices};
pub use records::{
    format_est, EnhancedRecord, FetchedTransaction, PriceRecord, RawTransaction, SignatureRecord,
    TokenBalance, TransactionMeta, INVALID_PRICE_DATA,
};
