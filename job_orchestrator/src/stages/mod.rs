// Fetch stages; each owns a cache that lives for a single pipeline run

pub mod cache;
pub mod prices;
pub mod signatures;
pub mod transactions;

pub use cache::RunCache;
pub use prices::PriceStage;
pub use signatures::SignatureStage;
pub use transactions::TransactionStage;
