use crate::records::PriceRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Price records split into one valid and at most one null record per mint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionedPrices {
    pub valid: Vec<PriceRecord>,
    pub null: Vec<PriceRecord>,
}

#[derive(Default)]
struct MintCandidates {
    valid: Option<PriceRecord>,
    failed: Option<PriceRecord>,
}

/// Replace `slot` unless it already holds a strictly later record
fn keep_latest(slot: &mut Option<PriceRecord>, record: PriceRecord) {
    match slot {
        Some(current) if current.timestamp > record.timestamp => {}
        _ => *slot = Some(record),
    }
}

/// Deduplicate price records per mint.
///
/// A mint with any valid record contributes its latest valid record (later
/// input wins ties) and nothing to `null`. A mint without one contributes its
/// latest failed record to `null`. Mints keep the order of first appearance.
pub fn partition(prices: impl IntoIterator<Item = PriceRecord>) -> PartitionedPrices {
    let mut order: Vec<String> = Vec::new();
    let mut by_mint: HashMap<String, MintCandidates> = HashMap::new();

    for record in prices {
        let candidates = by_mint.entry(record.mint.clone()).or_insert_with(|| {
            order.push(record.mint.clone());
            MintCandidates::default()
        });

        if record.is_valid() {
            keep_latest(&mut candidates.valid, record);
        } else {
            keep_latest(&mut candidates.failed, record);
        }
    }

    let mut result = PartitionedPrices::default();
    for mint in order {
        let Some(candidates) = by_mint.remove(&mint) else {
            continue;
        };
        match (candidates.valid, candidates.failed) {
            (Some(valid), _) => result.valid.push(valid),
            (None, Some(failed)) => result.null.push(failed),
            (None, None) => {}
        }
    }

    debug!(
        "Partitioned prices: {} valid, {} null",
        result.valid.len(),
        result.null.len()
    );
    result
}
