//! Normalization of catalog entries into [`MarketSnapshotRecord`]s.
//!
//! Two upstream shapes are accepted: CLOB market objects (snake_case, with a
//! `tokens` array) and Gamma market objects (camelCase, with token ids and
//! outcomes encoded as JSON strings).

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use pipeline_core::{Error, MarketSnapshotRecord, MarketStatus, OutcomeToken, Result};

/// Normalize one catalog entry. Entries without a condition id are
/// `MalformedRecord`.
pub fn normalize_market(entry: &Value, fetched_at: DateTime<Utc>) -> Result<MarketSnapshotRecord> {
    let obj = entry
        .as_object()
        .ok_or_else(|| Error::malformed_record("catalog entry is not an object"))?;

    let condition_id = string_field(obj, &["condition_id", "conditionId"])
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::malformed_record("catalog entry has no condition id"))?;

    let status = MarketStatus {
        active: bool_field(obj, &["active"]).unwrap_or(true),
        closed: bool_field(obj, &["closed"]).unwrap_or(false),
        archived: bool_field(obj, &["archived"]).unwrap_or(false),
        accepting_orders: bool_field(obj, &["accepting_orders", "acceptingOrders"]).unwrap_or(true),
    };

    Ok(MarketSnapshotRecord {
        condition_id,
        question_id: string_field(obj, &["question_id", "questionID", "questionId"]),
        question: string_field(obj, &["question", "title"]).unwrap_or_default(),
        market_slug: string_field(obj, &["market_slug", "slug"]),
        category: string_field(obj, &["category"]),
        status,
        tokens: tokens(obj),
        end_date: string_field(obj, &["end_date_iso", "endDate", "endDateIso"])
            .and_then(|s| parse_date(&s)),
        minimum_tick_size: number_field(obj, &["minimum_tick_size", "orderPriceMinTickSize"]),
        volume: number_field(obj, &["volume", "volumeNum"]),
        fetched_at,
    })
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match field(obj, keys)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match field(obj, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().to_ascii_lowercase().parse().ok(),
        _ => None,
    }
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    match field(obj, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A list that may arrive as a JSON array or as a string holding one.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
            _ => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        },
        _ => Vec::new(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tokens(obj: &Map<String, Value>) -> Vec<OutcomeToken> {
    if let Some(Value::Array(items)) = field(obj, &["tokens"]) {
        return items
            .iter()
            .filter_map(|t| {
                let t = t.as_object()?;
                let token_id = string_field(t, &["token_id", "tokenId"])?;
                Some(OutcomeToken {
                    token_id,
                    outcome: string_field(t, &["outcome"]).unwrap_or_default(),
                })
            })
            .collect();
    }

    let Some(ids) = field(obj, &["clobTokenIds", "clob_token_ids"]).map(string_list) else {
        return Vec::new();
    };
    let outcomes = field(obj, &["outcomes"]).map(string_list).unwrap_or_default();
    ids.into_iter()
        .filter(|id| !id.is_empty())
        .enumerate()
        .map(|(i, token_id)| OutcomeToken {
            token_id,
            outcome: outcomes.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
