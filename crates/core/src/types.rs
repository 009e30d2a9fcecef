//! Core data types for the market pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use ordered_float::OrderedFloat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Price type with ordering support.
pub type Price = OrderedFloat<f64>;

/// Size/quantity type.
pub type Size = f64;

/// Current wall-clock time in milliseconds.
#[inline]
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Identity of one pipeline execution: environment plus logical date.
///
/// Every staging batch, completion marker and upload cursor is namespaced
/// by a run key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    /// Environment name, e.g. "test" or "prod".
    pub environment: String,
    /// Logical date of the run.
    pub date: NaiveDate,
}

impl RunKey {
    /// Create a run key, rejecting environment names that are not safe
    /// path segments.
    pub fn new(environment: impl Into<String>, date: NaiveDate) -> Result<Self> {
        let environment = environment.into();
        validate_environment(&environment)?;
        Ok(Self { environment, date })
    }

    /// Parse a run key from an environment and a `YYYY-MM-DD` or `YYYYMMDD` date.
    pub fn parse(environment: impl Into<String>, date: &str) -> Result<Self> {
        Self::new(environment, parse_logical_date(date)?)
    }

    /// Date formatted for use as a directory name.
    pub fn date_segment(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.environment, self.date_segment())
    }
}

/// Check that an environment name only uses `[A-Za-z0-9_-]`.
pub fn validate_environment(environment: &str) -> Result<()> {
    if environment.is_empty() {
        return Err(Error::config("environment must not be empty"));
    }
    if !environment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::config(format!(
            "environment {environment:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Parse a logical date in `YYYY-MM-DD` or `YYYYMMDD` form.
pub fn parse_logical_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .map_err(|_| Error::config(format!("invalid logical date {s:?}")))
}

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    FetchCatalog,
    FilterOpen,
    UploadMarkets,
    StreamOrderBooks,
    UploadOrderBooks,
}

impl StageName {
    /// All stages in declaration order.
    pub const ALL: [StageName; 5] = [
        StageName::FetchCatalog,
        StageName::FilterOpen,
        StageName::UploadMarkets,
        StageName::StreamOrderBooks,
        StageName::UploadOrderBooks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::FetchCatalog => "fetch_catalog",
            StageName::FilterOpen => "filter_open",
            StageName::UploadMarkets => "upload_markets",
            StageName::StreamOrderBooks => "stream_order_books",
            StageName::UploadOrderBooks => "upload_order_books",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown stage {s:?}")))
    }
}

/// Names of the staging batches exchanged between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchName {
    /// Raw catalog snapshot written by the fetcher.
    Catalog,
    /// Open subset written by the filter.
    OpenMarkets,
    /// Order book records written by the streamer.
    OrderBooks,
}

impl BatchName {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchName::Catalog => "catalog",
            BatchName::OpenMarkets => "open_markets",
            BatchName::OrderBooks => "order_books",
        }
    }
}

impl fmt::Display for BatchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of record held by a staging batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    MarketSnapshot,
    OrderBook,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::MarketSnapshot => "market_snapshot",
            RecordKind::OrderBook => "order_book",
        }
    }
}

/// A record that can be staged and later upserted by natural key.
pub trait StagedRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Record kind written into batch headers.
    const KIND: RecordKind;

    /// Natural key used for upserts.
    fn natural_key(&self) -> String;

    /// Reject records that cannot be stored.
    fn validate(&self) -> Result<()>;
}

/// Market lifecycle flags as reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketStatus {
    pub active: bool,
    /// Closed markets are resolved.
    pub closed: bool,
    pub archived: bool,
    pub accepting_orders: bool,
}

impl MarketStatus {
    /// Open: active, not resolved, not archived, accepting orders.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.active && !self.closed && !self.archived && self.accepting_orders
    }
}

/// One tradable outcome token of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub token_id: String,
    pub outcome: String,
}

/// Snapshot of one market from one catalog fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshotRecord {
    /// Condition identifier (unique per market).
    pub condition_id: String,
    pub question_id: Option<String>,
    /// Question text.
    pub question: String,
    pub market_slug: Option<String>,
    pub category: Option<String>,
    pub status: MarketStatus,
    /// Outcome tokens, normally two (yes/no).
    pub tokens: Vec<OutcomeToken>,
    pub end_date: Option<DateTime<Utc>>,
    pub minimum_tick_size: Option<f64>,
    pub volume: Option<f64>,
    /// When the snapshot was taken.
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshotRecord {
    /// Token identifiers in outcome order.
    pub fn token_ids(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.token_id.as_str()).collect()
    }

    /// Token id at a given outcome index.
    pub fn token_id(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(|t| t.token_id.as_str())
    }
}

impl StagedRecord for MarketSnapshotRecord {
    const KIND: RecordKind = RecordKind::MarketSnapshot;

    fn natural_key(&self) -> String {
        self.condition_id.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.condition_id.trim().is_empty() {
            return Err(Error::malformed_record("market without condition_id"));
        }
        Ok(())
    }
}

/// A single (price, size) book level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub size: Size,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self {
            price: OrderedFloat(price),
            size,
        }
    }
}

/// Whether a record was produced by a full snapshot or an incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookUpdateKind {
    Snapshot,
    Delta,
}

/// State of one token's order book at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookRecord {
    /// Token identifier.
    pub token_id: String,
    /// Condition id of the owning market, when the feed reports it.
    pub market: Option<String>,
    /// Bid levels, best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<PriceLevel>,
    /// Capture timestamp in milliseconds.
    pub captured_at_ms: TimestampMs,
    /// Feed sequence number, if the feed provides one.
    pub sequence: Option<u64>,
    /// Feed book hash, if provided.
    pub hash: Option<String>,
    pub kind: BookUpdateKind,
}

impl OrderBookRecord {
    /// Best bid price.
    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price.into_inner())
    }

    /// Best ask price.
    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price.into_inner())
    }

    /// Mid price, when both sides are present.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Spread, when both sides are present.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// A crossed book (bid >= ask) is never valid.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }
}

impl StagedRecord for OrderBookRecord {
    const KIND: RecordKind = RecordKind::OrderBook;

    fn natural_key(&self) -> String {
        format!("{}:{}", self.token_id, self.captured_at_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.token_id.trim().is_empty() {
            return Err(Error::malformed_record("order book without token_id"));
        }
        if self.captured_at_ms <= 0 {
            return Err(Error::malformed_record(format!(
                "order book for {} has no capture time",
                self.token_id
            )));
        }
        Ok(())
    }
}

/// A tradable instrument tracked by the streamer: one market's tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Owning market, if known.
    pub condition_id: Option<String>,
    /// Token ids subscribed together on one connection.
    pub token_ids: Vec<String>,
}

impl Instrument {
    /// A single-token instrument.
    pub fn token(token_id: impl Into<String>) -> Self {
        Self {
            condition_id: None,
            token_ids: vec![token_id.into()],
        }
    }

    /// Instrument covering every token of a market.
    pub fn from_market(market: &MarketSnapshotRecord) -> Self {
        Self {
            condition_id: Some(market.condition_id.clone()),
            token_ids: market.tokens.iter().map(|t| t.token_id.clone()).collect(),
        }
    }

    /// Label used in logs.
    pub fn label(&self) -> String {
        match &self.condition_id {
            Some(id) => id.clone(),
            None => self.token_ids.join(","),
        }
    }
}
