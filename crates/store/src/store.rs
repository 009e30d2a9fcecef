//! Store seam shared by the uploader and downstream readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipeline_core::{BatchName, MarketSnapshotRecord, OrderBookRecord, Result, RunKey};

/// Rows touched by one upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    /// Rows whose natural key already existed and were overwritten.
    pub updated: usize,
    /// Rows left as they were because the stored version is newer.
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn add(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Progress marker for one batch upload: records `[0, committed)` of the
/// batch version published at `version` are durable in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    pub run: RunKey,
    pub batch: BatchName,
    pub version: DateTime<Utc>,
    pub committed: usize,
}

/// Destination of uploads.
///
/// Upserts are keyed by natural key and commit atomically together with
/// `cursor`, when one is given.
pub trait PersistentStore: Send + Sync {
    fn upsert_markets(
        &self,
        records: &[&MarketSnapshotRecord],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts>;

    fn upsert_order_books(
        &self,
        records: &[&OrderBookRecord],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts>;

    fn load_cursor(&self, run: &RunKey, batch: BatchName) -> Result<Option<UploadCursor>>;

    fn market(&self, condition_id: &str) -> Result<Option<MarketSnapshotRecord>>;

    /// Most recent book for a token by capture time.
    fn latest_order_book(&self, token_id: &str) -> Result<Option<OrderBookRecord>>;

    fn market_count(&self) -> Result<usize>;

    fn order_book_count(&self) -> Result<usize>;
}
