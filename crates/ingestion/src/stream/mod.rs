//! Order book streaming.
//!
//! One [`SubscriptionSession`] task per instrument pushes records into a
//! bounded channel; a single sink task batches them into staging segments
//! and the batch is sealed once every session has closed.

pub mod book;
pub mod message;
pub mod session;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use pipeline_core::config::StreamConfig;
use pipeline_core::{
    BatchName, Error, Instrument, MarketSnapshotRecord, OrderBookRecord, Result, RetryPolicy,
    RunKey,
};
use pipeline_staging::{BatchRef, StagingStore};

pub use session::{SessionParams, SessionState, SessionStateMachine, SessionStats, SubscriptionSession};
pub use transport::{FeedConnector, FeedFrame, FeedTransport, WsConnector};

use session::stop_requested;

/// Outcome of one streaming window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamReport {
    pub batch: BatchRef,
    pub instruments: usize,
    /// Segments written during this window.
    pub segments: usize,
    /// Records written during this window.
    pub records: usize,
    /// Counters summed over all sessions.
    pub sessions: SessionStats,
}

/// Supervises one session per instrument and stages what they emit.
pub struct OrderBookStreamer {
    connector: Arc<dyn FeedConnector>,
    staging: StagingStore,
    config: StreamConfig,
}

impl OrderBookStreamer {
    pub fn new(connector: Arc<dyn FeedConnector>, staging: StagingStore, config: StreamConfig) -> Self {
        Self {
            connector,
            staging,
            config,
        }
    }

    /// Instruments to stream for `run`: the configured ones plus, when
    /// `instruments_from_date` is set, every open market of that date.
    pub fn instruments(&self, run: &RunKey) -> Result<Vec<Instrument>> {
        let mut candidates = self.config.instruments.clone();
        if let Some(date) = self.config.instruments_from_date {
            let source = RunKey::new(run.environment.clone(), date)?;
            let markets: Vec<MarketSnapshotRecord> =
                self.staging.read(&source, BatchName::OpenMarkets)?;
            candidates.extend(markets.iter().map(Instrument::from_market));
        }

        let mut seen = HashSet::new();
        let mut instruments: Vec<Instrument> = candidates
            .into_iter()
            .filter(|i| !i.token_ids.is_empty())
            .filter(|i| seen.insert(i.token_ids.clone()))
            .collect();
        if let Some(max) = self.config.max_instruments {
            instruments.truncate(max);
        }
        Ok(instruments)
    }

    /// Stream until `stop` is set or the configured duration elapses, then
    /// flush and seal the `order_books` batch.
    pub async fn stream(&self, run: &RunKey, stop: watch::Receiver<bool>) -> Result<StreamReport> {
        let instruments = self.instruments(run)?;
        if instruments.is_empty() {
            warn!(run = %run, "no instruments to stream");
        }
        let deadline = Instant::now() + self.config.duration();
        let params = SessionParams {
            ping_interval: self.config.ping_interval(),
            liveness_timeout: self.config.liveness_timeout(),
            max_depth: self.config.max_book_depth,
            reconnect: RetryPolicy::from(&self.config.reconnect),
            deadline,
        };
        info!(
            run = %run,
            instruments = instruments.len(),
            max_concurrency = self.config.max_concurrency,
            duration_secs = self.config.duration_secs,
            "starting order book stream"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let sink = tokio::spawn(run_sink(
            self.staging.clone(),
            run.clone(),
            rx,
            self.config.flush_max_records,
            self.config.flush_interval(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut sessions = JoinSet::new();
        for instrument in &instruments {
            let session = SubscriptionSession::new(
                instrument.clone(),
                self.connector.clone(),
                params.clone(),
                tx.clone(),
            );
            let semaphore = semaphore.clone();
            let mut stop = stop.clone();
            sessions.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = stop_requested(&mut stop) => None,
                    _ = sleep_until(deadline) => None,
                };
                match permit {
                    Some(_permit) => session.run(stop).await,
                    None => session.abandon(),
                }
            });
        }
        drop(tx);

        let mut totals = SessionStats::default();
        let mut crashed = 0;
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(stats) => totals.merge(&stats),
                Err(e) => {
                    crashed += 1;
                    warn!(run = %run, error = %e, "session task failed");
                }
            }
        }

        let sink_report = sink
            .await
            .map_err(|e| Error::Other(format!("record sink task failed: {e}")))??;
        if crashed > 0 {
            return Err(Error::Other(format!(
                "{crashed} streaming session(s) crashed; segments kept for the retry"
            )));
        }

        let staging = self.staging.clone();
        let sealed_run = run.clone();
        let batch = tokio::task::spawn_blocking(move || {
            staging.seal_segments::<OrderBookRecord>(&sealed_run, BatchName::OrderBooks)
        })
        .await
        .map_err(|e| Error::Other(format!("seal task failed: {e}")))??;

        info!(
            run = %run,
            records = sink_report.records,
            segments = sink_report.segments,
            sealed = batch.count,
            reconnects = totals.reconnects,
            "order book stream finished"
        );
        Ok(StreamReport {
            batch,
            instruments: instruments.len(),
            segments: sink_report.segments,
            records: sink_report.records,
            sessions: totals,
        })
    }
}

#[derive(Debug, Default)]
struct SinkReport {
    records: usize,
    segments: usize,
}

/// Buffer records and append a segment on size or time, whichever first.
async fn run_sink(
    staging: StagingStore,
    run: RunKey,
    mut rx: mpsc::Receiver<OrderBookRecord>,
    flush_max_records: usize,
    flush_interval: Duration,
) -> Result<SinkReport> {
    let mut buffer = Vec::with_capacity(flush_max_records);
    let mut report = SinkReport::default();
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    buffer.push(record);
                    if buffer.len() >= flush_max_records {
                        flush(&staging, &run, &mut buffer, &mut report).await?;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&staging, &run, &mut buffer, &mut report).await?;
                }
            }
        }
    }
    if !buffer.is_empty() {
        flush(&staging, &run, &mut buffer, &mut report).await?;
    }
    Ok(report)
}

async fn flush(
    staging: &StagingStore,
    run: &RunKey,
    buffer: &mut Vec<OrderBookRecord>,
    report: &mut SinkReport,
) -> Result<()> {
    let records = std::mem::take(buffer);
    let count = records.len();
    let staging = staging.clone();
    let segment_run = run.clone();
    let segment = tokio::task::spawn_blocking(move || {
        staging.append_segment(&segment_run, BatchName::OrderBooks, &records)
    })
    .await
    .map_err(|e| Error::Other(format!("segment writer failed: {e}")))??;
    report.records += count;
    report.segments += 1;
    debug!(run = %run, segment = segment.index, count, "flushed order book segment");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeFeed, Step};
    use super::*;
    use pipeline_core::{MarketStatus, OutcomeToken};

    fn book(token: &str, ts: i64) -> Step {
        Step::Frame(format!(
            r#"{{"event_type":"book","asset_id":"{token}","timestamp":"{ts}","bids":[{{"price":"0.4","size":"10"}}],"asks":[{{"price":"0.6","size":"10"}}]}}"#
        ))
    }

    fn config(instruments: Vec<Instrument>) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.instruments = instruments;
        config.duration_secs = 30;
        config.flush_max_records = 2;
        config.reconnect.base_delay_ms = 1;
        config.reconnect.max_delay_ms = 5;
        config.reconnect.jitter_pct = 0.0;
        config
    }

    fn run_key() -> RunKey {
        RunKey::parse("test", "2024-01-01").unwrap()
    }

    fn open_market(id: &str, tokens: &[&str]) -> MarketSnapshotRecord {
        MarketSnapshotRecord {
            condition_id: id.to_string(),
            question_id: None,
            question: String::new(),
            market_slug: None,
            category: None,
            status: MarketStatus {
                active: true,
                closed: false,
                archived: false,
                accepting_orders: true,
            },
            tokens: tokens
                .iter()
                .map(|t| OutcomeToken {
                    token_id: t.to_string(),
                    outcome: String::new(),
                })
                .collect(),
            end_date: None,
            minimum_tick_size: None,
            volume: None,
            fetched_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stream_stages_and_seals_records() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let feed = Arc::new(FakeFeed::routed(vec![
            ("1", vec![vec![book("1", 10), book("1", 20), book("1", 30)]]),
            ("2", vec![vec![book("2", 15)]]),
        ]));
        let streamer = OrderBookStreamer::new(
            feed.clone(),
            staging.clone(),
            config(vec![Instrument::token("1"), Instrument::token("2")]),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        let run = run_key();
        let stream = tokio::spawn(async move { streamer.stream(&run, stop_rx).await });
        feed.wait_parked(2).await;
        stop_tx.send(true).unwrap();
        let report = stream.await.unwrap().unwrap();

        assert_eq!(report.instruments, 2);
        assert_eq!(report.records, 4);
        assert_eq!(report.batch.count, 4);
        assert_eq!(report.sessions.connects, 2);

        let records: Vec<OrderBookRecord> = staging.read(&run_key(), BatchName::OrderBooks).unwrap();
        let token_one: Vec<i64> = records
            .iter()
            .filter(|r| r.token_id == "1")
            .map(|r| r.captured_at_ms)
            .collect();
        assert_eq!(token_one, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_defers_extra_instruments() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::routed(vec![
            ("1", vec![vec![book("1", 10)]]),
            ("2", vec![vec![book("2", 10)]]),
        ]));
        let mut cfg = config(vec![Instrument::token("1"), Instrument::token("2")]);
        cfg.max_concurrency = 1;
        let streamer = OrderBookStreamer::new(feed.clone(), StagingStore::new(dir.path()), cfg);
        let (stop_tx, stop_rx) = watch::channel(false);

        let stream = tokio::spawn(async move { streamer.stream(&run_key(), stop_rx).await });
        feed.wait_parked(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the second instrument is still waiting for a permit
        assert_eq!(feed.sent_subscriptions(), 1);
        stop_tx.send(true).unwrap();

        let report = stream.await.unwrap().unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.sessions.connects, 1);
    }

    #[tokio::test]
    async fn test_instruments_from_open_markets() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let source_run = RunKey::parse("test", "2023-12-31").unwrap();
        staging
            .publish(
                &source_run,
                BatchName::OpenMarkets,
                &[
                    open_market("0xa", &["1", "2"]),
                    open_market("0xb", &["3", "4"]),
                    open_market("0xc", &[]),
                ],
            )
            .unwrap();

        let mut cfg = config(vec![Instrument::token("9")]);
        cfg.instruments_from_date = Some(source_run.date);
        let feed = Arc::new(FakeFeed::new(Vec::new()));
        let streamer = OrderBookStreamer::new(feed.clone(), staging.clone(), cfg.clone());
        let instruments = streamer.instruments(&run_key()).unwrap();
        let labels: Vec<String> = instruments.iter().map(Instrument::label).collect();
        assert_eq!(labels, vec!["9", "0xa", "0xb"]);

        cfg.max_instruments = Some(2);
        let capped = OrderBookStreamer::new(feed, staging, cfg);
        assert_eq!(capped.instruments(&run_key()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_instrument_source_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(Vec::new());
        cfg.instruments_from_date = chrono::NaiveDate::from_ymd_opt(2023, 12, 31);
        let streamer = OrderBookStreamer::new(
            Arc::new(FakeFeed::new(Vec::new())),
            StagingStore::new(dir.path()),
            cfg,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert!(matches!(
            streamer.stream(&run_key(), stop_rx).await,
            Err(Error::MissingInput(_))
        ));
    }

    #[tokio::test]
    async fn test_restarted_stream_keeps_earlier_segments() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let run = run_key();
        // left behind by an attempt that crashed before sealing
        staging
            .append_segment(
                &run,
                BatchName::OrderBooks,
                &[OrderBookRecord {
                    token_id: "1".to_string(),
                    market: None,
                    bids: Vec::new(),
                    asks: Vec::new(),
                    captured_at_ms: 5,
                    sequence: None,
                    hash: None,
                    kind: pipeline_core::BookUpdateKind::Snapshot,
                }],
            )
            .unwrap();

        let feed = Arc::new(FakeFeed::new(vec![vec![book("1", 10)]]));
        let streamer =
            OrderBookStreamer::new(feed.clone(), staging.clone(), config(vec![Instrument::token("1")]));
        let (stop_tx, stop_rx) = watch::channel(false);
        let stream = tokio::spawn(async move { streamer.stream(&run_key(), stop_rx).await });
        feed.wait_parked(1).await;
        stop_tx.send(true).unwrap();

        let report = stream.await.unwrap().unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.batch.count, 2);
    }

    #[tokio::test]
    async fn test_no_instruments_seals_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let streamer =
            OrderBookStreamer::new(Arc::new(FakeFeed::new(Vec::new())), staging.clone(), config(Vec::new()));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = streamer.stream(&run_key(), stop_rx).await.unwrap();
        assert_eq!(report.batch.count, 0);
        assert!(staging.exists(&run_key(), BatchName::OrderBooks));
    }
}
