//! Feed wire format.

use serde::Deserialize;
use serde_json::Value;

use pipeline_core::{now_ms, Error, PriceLevel, Result, TimestampMs};

/// Book side of a price change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// Full book for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub asset_id: String,
    pub market: Option<String>,
    pub timestamp_ms: TimestampMs,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub hash: Option<String>,
    pub sequence: Option<u64>,
}

/// One level change.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChange {
    pub asset_id: String,
    pub side: Side,
    pub price: f64,
    /// New size at `price`; zero removes the level.
    pub size: f64,
    pub hash: Option<String>,
}

/// A `price_change` event: changes sharing one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChangeBatch {
    pub market: Option<String>,
    pub timestamp_ms: TimestampMs,
    pub sequence: Option<u64>,
    pub changes: Vec<PriceChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Book(BookSnapshot),
    PriceChange(PriceChangeBatch),
    Pong,
    /// Events the pipeline does not record (trades, tick size changes).
    Ignored(String),
    /// An event that could not be decoded; its siblings are unaffected.
    Malformed(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

impl NumOrStr {
    fn as_f64(&self) -> Option<f64> {
        match self {
            NumOrStr::Num(n) => Some(*n),
            NumOrStr::Str(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct WireLevel {
    price: NumOrStr,
    size: NumOrStr,
}

#[derive(Deserialize)]
struct WireBook {
    asset_id: String,
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    timestamp: Option<NumOrStr>,
    #[serde(default, alias = "buys")]
    bids: Vec<WireLevel>,
    #[serde(default, alias = "sells")]
    asks: Vec<WireLevel>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default, alias = "sequence")]
    seq: Option<u64>,
}

#[derive(Deserialize)]
struct WireChange {
    asset_id: String,
    price: NumOrStr,
    size: NumOrStr,
    side: String,
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Deserialize)]
struct WirePriceChange {
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    timestamp: Option<NumOrStr>,
    #[serde(default, alias = "sequence")]
    seq: Option<u64>,
    #[serde(default)]
    price_changes: Vec<WireChange>,
}

/// Subscribe message for a set of tokens.
pub fn subscribe_message(token_ids: &[String]) -> String {
    serde_json::json!({
        "type": "market",
        "assets_ids": token_ids,
    })
    .to_string()
}

/// Parse one text frame. A frame carries a single event or an array of
/// events. Text that is neither `PONG` nor JSON is a protocol error; an
/// undecodable event inside valid JSON becomes [`FeedEvent::Malformed`].
pub fn parse_frame(text: &str) -> Result<Vec<FeedEvent>> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("PONG") {
        return Ok(vec![FeedEvent::Pong]);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::transient(format!("protocol error: non-JSON frame: {e}")))?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items
        .into_iter()
        .map(|item| parse_event(item).unwrap_or_else(|e| FeedEvent::Malformed(e.to_string())))
        .collect())
}

fn parse_event(value: Value) -> Result<FeedEvent> {
    let event_type = value
        .get("event_type")
        .or_else(|| value.get("eventType"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match event_type.as_str() {
        "book" => {
            let wire: WireBook = serde_json::from_value(value)
                .map_err(|e| Error::malformed_record(format!("bad book event: {e}")))?;
            Ok(FeedEvent::Book(BookSnapshot {
                asset_id: wire.asset_id,
                market: wire.market,
                timestamp_ms: timestamp(wire.timestamp.as_ref()),
                bids: levels(&wire.bids)?,
                asks: levels(&wire.asks)?,
                hash: wire.hash,
                sequence: wire.seq,
            }))
        }
        "price_change" => {
            let wire: WirePriceChange = serde_json::from_value(value)
                .map_err(|e| Error::malformed_record(format!("bad price_change event: {e}")))?;
            let changes = wire
                .price_changes
                .into_iter()
                .map(|c| -> Result<PriceChange> {
                    let side = match c.side.to_ascii_uppercase().as_str() {
                        "BUY" | "BID" => Side::Bid,
                        "SELL" | "ASK" => Side::Ask,
                        other => {
                            return Err(Error::malformed_record(format!(
                                "unknown side {other:?}"
                            )))
                        }
                    };
                    Ok(PriceChange {
                        asset_id: c.asset_id,
                        side,
                        price: number(&c.price, "price")?,
                        size: number(&c.size, "size")?,
                        hash: c.hash,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(FeedEvent::PriceChange(PriceChangeBatch {
                market: wire.market,
                timestamp_ms: timestamp(wire.timestamp.as_ref()),
                sequence: wire.seq,
                changes,
            }))
        }
        other => Ok(FeedEvent::Ignored(other.to_string())),
    }
}

fn number(value: &NumOrStr, what: &str) -> Result<f64> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::malformed_record(format!("bad {what}")))
}

fn levels(wire: &[WireLevel]) -> Result<Vec<PriceLevel>> {
    wire.iter()
        .map(|l| -> Result<PriceLevel> {
            Ok(PriceLevel::new(number(&l.price, "price")?, number(&l.size, "size")?))
        })
        .collect()
}

/// Feed timestamps are epoch milliseconds, usually as strings. Missing or
/// unparseable timestamps fall back to local receive time.
fn timestamp(raw: Option<&NumOrStr>) -> TimestampMs {
    raw.and_then(NumOrStr::as_f64)
        .filter(|ts| *ts > 0.0)
        .map(|ts| ts as TimestampMs)
        .unwrap_or_else(now_ms)
}
