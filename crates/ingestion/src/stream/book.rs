//! Local order book maintained per token.

use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

use pipeline_core::{BookUpdateKind, OrderBookRecord, Price, PriceLevel, Size, TimestampMs};

use super::message::Side;

/// Price-keyed book for one token.
#[derive(Debug, Clone, Default)]
pub struct LocalBook {
    bids: BTreeMap<Price, Size>,
    asks: BTreeMap<Price, Size>,
}

impl LocalBook {
    /// Replace the whole book.
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids = collect_side(bids);
        self.asks = collect_side(asks);
    }

    /// Set the size at one level; zero or negative size removes it.
    pub fn apply_change(&mut self, side: Side, price: f64, size: f64) {
        let levels = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if size > 0.0 {
            levels.insert(OrderedFloat(price), size);
        } else {
            levels.remove(&OrderedFloat(price));
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Bids best-first (descending), at most `depth` levels.
    pub fn bids(&self, depth: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(depth)
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
            .collect()
    }

    /// Asks best-first (ascending), at most `depth` levels.
    pub fn asks(&self, depth: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(depth)
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
            .collect()
    }

    /// Depth-limited record of the current state.
    #[allow(clippy::too_many_arguments)]
    pub fn to_record(
        &self,
        token_id: &str,
        market: Option<String>,
        captured_at_ms: TimestampMs,
        sequence: Option<u64>,
        hash: Option<String>,
        kind: BookUpdateKind,
        depth: usize,
    ) -> OrderBookRecord {
        OrderBookRecord {
            token_id: token_id.to_string(),
            market,
            bids: self.bids(depth),
            asks: self.asks(depth),
            captured_at_ms,
            sequence,
            hash,
            kind,
        }
    }
}

fn collect_side(levels: &[PriceLevel]) -> BTreeMap<Price, Size> {
    levels
        .iter()
        .filter(|l| l.size > 0.0)
        .map(|l| (l.price, l.size))
        .collect()
}
