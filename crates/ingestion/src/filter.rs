//! Selection of currently open markets.

use serde::{Deserialize, Serialize};
use tracing::info;

use pipeline_core::{BatchName, MarketSnapshotRecord, Result, RunKey};
use pipeline_staging::{BatchRef, StagingStore};

/// Outcome of one filter pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterReport {
    pub batch: BatchRef,
    /// Records read from the catalog batch.
    pub input: usize,
    /// Records kept.
    pub kept: usize,
}

/// Reads the `catalog` batch and publishes its open subset as
/// `open_markets`.
#[derive(Debug, Clone)]
pub struct OpenSetFilter {
    staging: StagingStore,
}

impl OpenSetFilter {
    pub fn new(staging: StagingStore) -> Self {
        Self { staging }
    }

    pub fn filter(&self, run: &RunKey) -> Result<FilterReport> {
        let catalog: Vec<MarketSnapshotRecord> = self.staging.read(run, BatchName::Catalog)?;
        let input = catalog.len();
        let open = select_open(catalog);
        let batch = self.staging.publish(run, BatchName::OpenMarkets, &open)?;
        info!(run = %run, input, kept = open.len(), "filtered open markets");
        Ok(FilterReport {
            batch,
            input,
            kept: open.len(),
        })
    }
}

/// Keep the markets that are active, unresolved, not archived and accepting
/// orders, preserving order.
pub fn select_open(markets: Vec<MarketSnapshotRecord>) -> Vec<MarketSnapshotRecord> {
    markets.into_iter().filter(|m| m.status.is_open()).collect()
}
