//! SQLite implementation of the persistent store.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

use pipeline_core::config::StoreConfig;
use pipeline_core::{
    BatchName, BookUpdateKind, Error, MarketSnapshotRecord, MarketStatus, OrderBookRecord,
    OutcomeToken, PriceLevel, Result, RunKey,
};

use crate::store::{PersistentStore, UploadCursor, UpsertCounts};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS markets (
        condition_id TEXT PRIMARY KEY,
        question_id TEXT,
        question TEXT NOT NULL,
        market_slug TEXT,
        category TEXT,
        active INTEGER NOT NULL,
        closed INTEGER NOT NULL,
        archived INTEGER NOT NULL,
        accepting_orders INTEGER NOT NULL,
        tokens TEXT NOT NULL,
        end_date TEXT,
        minimum_tick_size REAL,
        volume REAL,
        fetched_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS order_books (
        token_id TEXT NOT NULL,
        captured_at_ms INTEGER NOT NULL,
        market TEXT,
        bids TEXT NOT NULL,
        asks TEXT NOT NULL,
        best_bid REAL,
        best_ask REAL,
        sequence INTEGER,
        hash TEXT,
        kind TEXT NOT NULL,
        PRIMARY KEY (token_id, captured_at_ms)
    );

    CREATE TABLE IF NOT EXISTS upload_cursors (
        environment TEXT NOT NULL,
        logical_date TEXT NOT NULL,
        batch TEXT NOT NULL,
        version TEXT NOT NULL,
        committed INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (environment, logical_date, batch)
    );
"#;

// A newer snapshot supersedes an older one; replaying an older run never
// rolls a market back.
const UPSERT_MARKET: &str = r#"
    INSERT INTO markets (
        condition_id, question_id, question, market_slug, category,
        active, closed, archived, accepting_orders, tokens,
        end_date, minimum_tick_size, volume, fetched_at_ms
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    ON CONFLICT (condition_id) DO UPDATE SET
        question_id = excluded.question_id,
        question = excluded.question,
        market_slug = excluded.market_slug,
        category = excluded.category,
        active = excluded.active,
        closed = excluded.closed,
        archived = excluded.archived,
        accepting_orders = excluded.accepting_orders,
        tokens = excluded.tokens,
        end_date = excluded.end_date,
        minimum_tick_size = excluded.minimum_tick_size,
        volume = excluded.volume,
        fetched_at_ms = excluded.fetched_at_ms
    WHERE excluded.fetched_at_ms >= markets.fetched_at_ms
"#;

const UPSERT_ORDER_BOOK: &str = r#"
    INSERT INTO order_books (
        token_id, captured_at_ms, market, bids, asks,
        best_bid, best_ask, sequence, hash, kind
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT (token_id, captured_at_ms) DO UPDATE SET
        market = excluded.market,
        bids = excluded.bids,
        asks = excluded.asks,
        best_bid = excluded.best_bid,
        best_ask = excluded.best_ask,
        sequence = excluded.sequence,
        hash = excluded.hash,
        kind = excluded.kind
"#;

const UPSERT_CURSOR: &str = r#"
    INSERT INTO upload_cursors (environment, logical_date, batch, version, committed, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (environment, logical_date, batch) DO UPDATE SET
        version = excluded.version,
        committed = excluded.committed,
        updated_at = excluded.updated_at
"#;

/// Map SQLite failures onto the pipeline taxonomy. Lock contention and an
/// unopenable file are worth retrying.
fn db_err(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            Error::store_unavailable(err.to_string())
        }
        _ => Error::database(err.to_string()),
    }
}

/// SQLite-backed store. The connection is synchronous; async callers go
/// through `spawn_blocking`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.path)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::database("connection mutex poisoned"))
    }

    fn count(&self, table: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

fn write_cursor(tx: &Transaction<'_>, cursor: &UploadCursor) -> Result<()> {
    tx.execute(
        UPSERT_CURSOR,
        params![
            cursor.run.environment,
            cursor.run.date_segment(),
            cursor.batch.as_str(),
            cursor.version.to_rfc3339(),
            cursor.committed as i64,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn kind_str(kind: BookUpdateKind) -> &'static str {
    match kind {
        BookUpdateKind::Snapshot => "snapshot",
        BookUpdateKind::Delta => "delta",
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::database(format!("bad timestamp {raw:?}: {e}")))
}

impl PersistentStore for SqliteStore {
    fn upsert_markets(
        &self,
        records: &[&MarketSnapshotRecord],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let mut counts = UpsertCounts::default();
        {
            let mut upsert = tx.prepare_cached(UPSERT_MARKET).map_err(db_err)?;
            let mut probe = tx
                .prepare_cached("SELECT 1 FROM markets WHERE condition_id = ?1")
                .map_err(db_err)?;
            for market in records {
                let existed = probe.exists([&market.condition_id]).map_err(db_err)?;
                let changed = upsert
                    .execute(params![
                        market.condition_id,
                        market.question_id,
                        market.question,
                        market.market_slug,
                        market.category,
                        market.status.active,
                        market.status.closed,
                        market.status.archived,
                        market.status.accepting_orders,
                        serde_json::to_string(&market.tokens)?,
                        market.end_date.map(|d| d.to_rfc3339()),
                        market.minimum_tick_size,
                        market.volume,
                        market.fetched_at.timestamp_millis(),
                    ])
                    .map_err(db_err)?;
                match (existed, changed) {
                    (false, _) => counts.inserted += 1,
                    (true, 0) => counts.unchanged += 1,
                    (true, _) => counts.updated += 1,
                }
            }
        }
        if let Some(cursor) = cursor {
            write_cursor(&tx, cursor)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(counts)
    }

    fn upsert_order_books(
        &self,
        records: &[&OrderBookRecord],
        cursor: Option<&UploadCursor>,
    ) -> Result<UpsertCounts> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let mut counts = UpsertCounts::default();
        {
            let mut upsert = tx.prepare_cached(UPSERT_ORDER_BOOK).map_err(db_err)?;
            let mut probe = tx
                .prepare_cached(
                    "SELECT 1 FROM order_books WHERE token_id = ?1 AND captured_at_ms = ?2",
                )
                .map_err(db_err)?;
            for book in records {
                let existed = probe
                    .exists(params![book.token_id, book.captured_at_ms])
                    .map_err(db_err)?;
                upsert
                    .execute(params![
                        book.token_id,
                        book.captured_at_ms,
                        book.market,
                        serde_json::to_string(&book.bids)?,
                        serde_json::to_string(&book.asks)?,
                        book.best_bid(),
                        book.best_ask(),
                        book.sequence.map(|s| s as i64),
                        book.hash,
                        kind_str(book.kind),
                    ])
                    .map_err(db_err)?;
                if existed {
                    counts.updated += 1;
                } else {
                    counts.inserted += 1;
                }
            }
        }
        if let Some(cursor) = cursor {
            write_cursor(&tx, cursor)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(counts)
    }

    fn load_cursor(&self, run: &RunKey, batch: BatchName) -> Result<Option<UploadCursor>> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT version, committed FROM upload_cursors
                 WHERE environment = ?1 AND logical_date = ?2 AND batch = ?3",
                params![run.environment, run.date_segment(), batch.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        row.map(|(version, committed)| {
            Ok(UploadCursor {
                run: run.clone(),
                batch,
                version: parse_time(&version)?,
                committed: committed.max(0) as usize,
            })
        })
        .transpose()
    }

    fn market(&self, condition_id: &str) -> Result<Option<MarketSnapshotRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT condition_id, question_id, question, market_slug, category,
                        active, closed, archived, accepting_orders, tokens,
                        end_date, minimum_tick_size, volume, fetched_at_ms
                 FROM markets WHERE condition_id = ?1",
                [condition_id],
                |row| {
                    Ok(MarketRow {
                        condition_id: row.get(0)?,
                        question_id: row.get(1)?,
                        question: row.get(2)?,
                        market_slug: row.get(3)?,
                        category: row.get(4)?,
                        status: MarketStatus {
                            active: row.get(5)?,
                            closed: row.get(6)?,
                            archived: row.get(7)?,
                            accepting_orders: row.get(8)?,
                        },
                        tokens: row.get(9)?,
                        end_date: row.get(10)?,
                        minimum_tick_size: row.get(11)?,
                        volume: row.get(12)?,
                        fetched_at_ms: row.get(13)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        row.map(MarketRow::into_record).transpose()
    }

    fn latest_order_book(&self, token_id: &str) -> Result<Option<OrderBookRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT token_id, captured_at_ms, market, bids, asks, sequence, hash, kind
                 FROM order_books WHERE token_id = ?1
                 ORDER BY captured_at_ms DESC LIMIT 1",
                [token_id],
                |row| {
                    Ok(OrderBookRow {
                        token_id: row.get(0)?,
                        captured_at_ms: row.get(1)?,
                        market: row.get(2)?,
                        bids: row.get(3)?,
                        asks: row.get(4)?,
                        sequence: row.get(5)?,
                        hash: row.get(6)?,
                        kind: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        row.map(OrderBookRow::into_record).transpose()
    }

    fn market_count(&self) -> Result<usize> {
        self.count("markets")
    }

    fn order_book_count(&self) -> Result<usize> {
        self.count("order_books")
    }
}

struct MarketRow {
    condition_id: String,
    question_id: Option<String>,
    question: String,
    market_slug: Option<String>,
    category: Option<String>,
    status: MarketStatus,
    tokens: String,
    end_date: Option<String>,
    minimum_tick_size: Option<f64>,
    volume: Option<f64>,
    fetched_at_ms: i64,
}

impl MarketRow {
    fn into_record(self) -> Result<MarketSnapshotRecord> {
        let tokens: Vec<OutcomeToken> = serde_json::from_str(&self.tokens)?;
        let fetched_at = Utc
            .timestamp_millis_opt(self.fetched_at_ms)
            .single()
            .ok_or_else(|| Error::database(format!("bad fetched_at {}", self.fetched_at_ms)))?;
        Ok(MarketSnapshotRecord {
            condition_id: self.condition_id,
            question_id: self.question_id,
            question: self.question,
            market_slug: self.market_slug,
            category: self.category,
            status: self.status,
            tokens,
            end_date: self.end_date.as_deref().map(parse_time).transpose()?,
            minimum_tick_size: self.minimum_tick_size,
            volume: self.volume,
            fetched_at,
        })
    }
}

struct OrderBookRow {
    token_id: String,
    captured_at_ms: i64,
    market: Option<String>,
    bids: String,
    asks: String,
    sequence: Option<i64>,
    hash: Option<String>,
    kind: String,
}

impl OrderBookRow {
    fn into_record(self) -> Result<OrderBookRecord> {
        let bids: Vec<PriceLevel> = serde_json::from_str(&self.bids)?;
        let asks: Vec<PriceLevel> = serde_json::from_str(&self.asks)?;
        let kind = match self.kind.as_str() {
            "snapshot" => BookUpdateKind::Snapshot,
            "delta" => BookUpdateKind::Delta,
            other => return Err(Error::database(format!("unknown book kind {other:?}"))),
        };
        Ok(OrderBookRecord {
            token_id: self.token_id,
            market: self.market,
            bids,
            asks,
            captured_at_ms: self.captured_at_ms,
            sequence: self.sequence.map(|s| s as u64),
            hash: self.hash,
            kind,
        })
    }
}
