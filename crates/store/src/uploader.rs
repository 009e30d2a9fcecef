//! Resumable batch upload.
//!
//! A batch is upserted in chunks. Each chunk commits in one store
//! transaction together with the upload cursor, so a crashed upload resumes
//! after the last committed chunk. Upserts are keyed by natural key, so
//! replaying a chunk (or the whole batch without a cursor) leaves the store
//! unchanged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use pipeline_core::config::UploadConfig;
use pipeline_core::{
    BatchName, Error, MarketSnapshotRecord, OrderBookRecord, Result, RetryPolicy, RunKey,
    StagedRecord,
};
use pipeline_staging::StagingStore;

use crate::store::{PersistentStore, UploadCursor, UpsertCounts};

/// A staged record type the store knows how to upsert.
pub trait Uploadable: StagedRecord {
    fn upsert(
        store: &dyn PersistentStore,
        records: &[&Self],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts>;
}

impl Uploadable for MarketSnapshotRecord {
    fn upsert(
        store: &dyn PersistentStore,
        records: &[&Self],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts> {
        store.upsert_markets(records, cursor)
    }
}

impl Uploadable for OrderBookRecord {
    fn upsert(
        store: &dyn PersistentStore,
        records: &[&Self],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts> {
        store.upsert_order_books(records, cursor)
    }
}

/// Outcome of one upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub batch: Option<BatchName>,
    /// Records sent to the store by this invocation.
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Records whose stored row was already newer.
    pub unchanged: usize,
    /// Records covered by the cursor of an earlier invocation.
    pub skipped: usize,
    /// Records that failed validation.
    pub malformed: usize,
    /// Batch index the upload resumed from, if it resumed.
    pub resumed_from: Option<usize>,
    pub chunks: usize,
}

struct ChunkOutcome {
    counts: UpsertCounts,
    attempted: usize,
    malformed: usize,
}

/// Moves staging batches into the persistent store.
pub struct ResumableUploader {
    staging: StagingStore,
    store: Arc<dyn PersistentStore>,
    config: UploadConfig,
}

impl ResumableUploader {
    pub fn new(staging: StagingStore, store: Arc<dyn PersistentStore>, config: UploadConfig) -> Self {
        Self {
            staging,
            store,
            config,
        }
    }

    /// Upload one batch. Fails with `MissingInput` when the batch was never
    /// published, `StoreUnavailable` when a chunk exhausts its retries and
    /// `DeadlineExceeded` past the upload budget. Chunks committed before a
    /// failure stay committed.
    pub async fn upload<R: Uploadable>(&self, run: &RunKey, batch: BatchName) -> Result<UploadReport> {
        let budget = self.config.budget();
        match tokio::time::timeout(budget, self.upload_chunks::<R>(run, batch)).await {
            Ok(result) => result,
            Err(_) => Err(Error::deadline(format!(
                "upload of {batch} for {run} exceeded {}s",
                budget.as_secs()
            ))),
        }
    }

    async fn upload_chunks<R: Uploadable>(&self, run: &RunKey, batch: BatchName) -> Result<UploadReport> {
        let staging = self.staging.clone();
        let load_run = run.clone();
        let loaded = tokio::task::spawn_blocking(move || staging.load::<R>(&load_run, batch))
            .await
            .map_err(|e| Error::Other(format!("batch reader failed: {e}")))??;
        let version = loaded.published_at;
        let records = Arc::new(loaded.records);
        let total = records.len();

        let start = if self.config.use_cursor {
            self.resume_point(run, batch, version, total).await?
        } else {
            0
        };
        let mut report = UploadReport {
            batch: Some(batch),
            skipped: start,
            resumed_from: (start > 0).then_some(start),
            ..UploadReport::default()
        };
        info!(
            run = %run,
            batch = %batch,
            total,
            start,
            chunk_size = self.config.chunk_size,
            "uploading batch"
        );

        let policy = RetryPolicy::from(&self.config.retry);
        let chunk_size = self.config.chunk_size.max(1);
        let mut offset = start;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            let cursor = self.config.use_cursor.then(|| UploadCursor {
                run: run.clone(),
                batch,
                version,
                committed: end,
            });
            let store = self.store.clone();
            let policy = policy.clone();
            let records = records.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                upload_chunk(store.as_ref(), &policy, &records[offset..end], cursor.as_ref())
            })
            .await
            .map_err(|e| Error::Other(format!("chunk writer failed: {e}")))??;

            report.attempted += outcome.attempted;
            report.inserted += outcome.counts.inserted;
            report.updated += outcome.counts.updated;
            report.unchanged += outcome.counts.unchanged;
            report.malformed += outcome.malformed;
            report.chunks += 1;
            debug!(run = %run, batch = %batch, committed = end, "chunk committed");
            offset = end;
        }

        info!(
            run = %run,
            batch = %batch,
            attempted = report.attempted,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            malformed = report.malformed,
            "upload finished"
        );
        Ok(report)
    }

    /// Index to resume from. A cursor written for another version of the
    /// batch is ignored.
    async fn resume_point(
        &self,
        run: &RunKey,
        batch: BatchName,
        version: chrono::DateTime<chrono::Utc>,
        total: usize,
    ) -> Result<usize> {
        let store = self.store.clone();
        let cursor_run = run.clone();
        let cursor = tokio::task::spawn_blocking(move || store.load_cursor(&cursor_run, batch))
            .await
            .map_err(|e| Error::Other(format!("cursor reader failed: {e}")))??;
        Ok(match cursor {
            Some(cursor) if cursor.version == version && cursor.committed <= total => {
                if cursor.committed > 0 {
                    info!(run = %run, batch = %batch, committed = cursor.committed, "resuming upload");
                }
                cursor.committed
            }
            Some(cursor) => {
                warn!(
                    run = %run,
                    batch = %batch,
                    cursor_version = %cursor.version,
                    batch_version = %version,
                    "upload cursor belongs to another batch version, starting over"
                );
                0
            }
            None => 0,
        })
    }
}

fn upload_chunk<R: Uploadable>(
    store: &dyn PersistentStore,
    policy: &RetryPolicy,
    chunk: &[R],
    cursor: Option<&UploadCursor>,
) -> Result<ChunkOutcome> {
    let valid: Vec<&R> = chunk
        .iter()
        .filter(|record| match record.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %record.natural_key(), error = %e, "skipping malformed record");
                false
            }
        })
        .collect();
    let counts = policy.retry_blocking(|attempt| {
        if attempt > 0 {
            debug!(attempt, "retrying chunk");
        }
        R::upsert(store, &valid, cursor)
    })?;
    Ok(ChunkOutcome {
        counts,
        attempted: valid.len(),
        malformed: chunk.len() - valid.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use chrono::Utc;
    use pipeline_core::config::RetryConfig;
    use pipeline_core::{MarketStatus, OutcomeToken};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_key() -> RunKey {
        RunKey::parse("test", "2024-01-01").unwrap()
    }

    fn market(id: &str) -> MarketSnapshotRecord {
        MarketSnapshotRecord {
            condition_id: id.to_string(),
            question_id: None,
            question: format!("question {id}"),
            market_slug: None,
            category: None,
            status: MarketStatus {
                active: true,
                closed: false,
                archived: false,
                accepting_orders: true,
            },
            tokens: vec![OutcomeToken {
                token_id: format!("{id}-yes"),
                outcome: "Yes".to_string(),
            }],
            end_date: None,
            minimum_tick_size: None,
            volume: None,
            fetched_at: Utc::now(),
        }
    }

    fn markets(n: usize) -> Vec<MarketSnapshotRecord> {
        (0..n).map(|i| market(&format!("0x{i:02}"))).collect()
    }

    fn config(chunk_size: usize, use_cursor: bool) -> UploadConfig {
        UploadConfig {
            chunk_size,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_pct: 0.0,
            },
            budget_secs: 60,
            use_cursor,
        }
    }

    /// Wraps a real store; fails chunk writes on demand.
    struct FlakyStore {
        inner: SqliteStore,
        calls: AtomicUsize,
        /// 1-based call number from which writes fail permanently; 0 never.
        fail_from: AtomicUsize,
        /// Leading calls failing with a retryable error.
        busy_calls: usize,
    }

    impl FlakyStore {
        fn new(fail_from: usize, busy_calls: usize) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                calls: AtomicUsize::new(0),
                fail_from: AtomicUsize::new(fail_from),
                busy_calls,
            }
        }

        fn check(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.busy_calls {
                return Err(Error::store_unavailable("database is locked"));
            }
            let fail_from = self.fail_from.load(Ordering::SeqCst);
            if fail_from > 0 && call >= fail_from {
                return Err(Error::database("disk I/O error"));
            }
            Ok(())
        }
    }

    impl PersistentStore for FlakyStore {
        fn upsert_markets(
            &self,
            records: &[&MarketSnapshotRecord],
            cursor: Option<&UploadCursor>,
        ) -> Result<UpsertCounts> {
            self.check()?;
            self.inner.upsert_markets(records, cursor)
        }

        fn upsert_order_books(
            &self,
            records: &[&OrderBookRecord],
            cursor: Option<&UploadCursor>,
        ) -> Result<UpsertCounts> {
            self.check()?;
            self.inner.upsert_order_books(records, cursor)
        }

        fn load_cursor(&self, run: &RunKey, batch: BatchName) -> Result<Option<UploadCursor>> {
            self.inner.load_cursor(run, batch)
        }

        fn market(&self, condition_id: &str) -> Result<Option<MarketSnapshotRecord>> {
            self.inner.market(condition_id)
        }

        fn latest_order_book(&self, token_id: &str) -> Result<Option<OrderBookRecord>> {
            self.inner.latest_order_book(token_id)
        }

        fn market_count(&self) -> Result<usize> {
            self.inner.market_count()
        }

        fn order_book_count(&self) -> Result<usize> {
            self.inner.order_book_count()
        }
    }

    #[tokio::test]
    async fn test_upload_is_idempotent_without_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(10))
            .unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let uploader = ResumableUploader::new(staging, store.clone(), config(4, false));

        let first = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(first.inserted, 10);
        assert_eq!(first.chunks, 3);

        let second = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 10);
        assert_eq!(store.market_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_completed_cursor_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(10))
            .unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let uploader = ResumableUploader::new(staging, store.clone(), config(4, true));

        uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        let again = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(again.skipped, 10);
        assert_eq!(again.attempted, 0);
        assert_eq!(again.resumed_from, Some(10));
        assert_eq!(store.market_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_crashed_upload_resumes_after_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(10))
            .unwrap();

        let flaky = Arc::new(FlakyStore::new(3, 0));
        let uploader = ResumableUploader::new(staging.clone(), flaky.clone(), config(3, true));
        let err = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(flaky.market_count().unwrap(), 6);
        let cursor = flaky
            .load_cursor(&run_key(), BatchName::OpenMarkets)
            .unwrap()
            .unwrap();
        assert_eq!(cursor.committed, 6);

        // same database, healthy again
        flaky.fail_from.store(0, Ordering::SeqCst);
        let uploader = ResumableUploader::new(staging, flaky.clone(), config(3, true));
        let report = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(report.resumed_from, Some(6));
        assert_eq!(report.skipped, 6);
        assert_eq!(report.attempted, 4);
        assert_eq!(report.inserted, 4);
        assert_eq!(report.updated, 0);
        assert_eq!(flaky.market_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_busy_store_is_retried_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(5))
            .unwrap();
        let flaky = Arc::new(FlakyStore::new(0, 2));
        let uploader = ResumableUploader::new(staging, flaky.clone(), config(10, true));

        let report = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(report.inserted, 5);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(5))
            .unwrap();
        let flaky = Arc::new(FlakyStore::new(0, usize::MAX));
        let uploader = ResumableUploader::new(staging, flaky, config(10, true));

        let err = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let mut records = markets(3);
        records.push(market(" "));
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &records)
            .unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let uploader = ResumableUploader::new(staging, store.clone(), config(2, true));

        let report = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.attempted, 3);
        assert_eq!(store.market_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_republished_batch_ignores_stale_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(4))
            .unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let uploader = ResumableUploader::new(staging.clone(), store.clone(), config(10, true));
        uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(6))
            .unwrap();
        let report = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap();
        assert_eq!(report.resumed_from, None);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 4);
    }

    #[tokio::test]
    async fn test_missing_batch_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = ResumableUploader::new(
            StagingStore::new(dir.path()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            config(10, true),
        );
        let err = uploader
            .upload::<OrderBookRecord>(&run_key(), BatchName::OrderBooks)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_zero_budget_is_deadline_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        staging
            .publish(&run_key(), BatchName::OpenMarkets, &markets(3))
            .unwrap();
        let mut cfg = config(1, true);
        cfg.budget_secs = 0;
        let uploader =
            ResumableUploader::new(staging, Arc::new(SqliteStore::open_in_memory().unwrap()), cfg);
        let err = uploader
            .upload::<MarketSnapshotRecord>(&run_key(), BatchName::OpenMarkets)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
    }
}
