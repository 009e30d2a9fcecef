//! Paginated catalog fetch.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use pipeline_core::config::{Credentials, Endpoints, FetchConfig};
use pipeline_core::retry::exhausted;
use pipeline_core::{BatchName, Error, MarketSnapshotRecord, Result, RetryPolicy, RunKey};
use pipeline_staging::{BatchRef, StagingStore};

use crate::normalize::normalize_market;

/// Cursor the CLOB API returns after the last page.
pub const END_CURSOR: &str = "LTE=";

const API_KEY_HEADER: &str = "POLY_API_KEY";

/// One page of raw catalog entries.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub entries: Vec<Value>,
    pub next_cursor: Option<String>,
}

impl CatalogPage {
    /// Whether no further page should be requested.
    pub fn is_last(&self) -> bool {
        self.entries.is_empty()
            || match self.next_cursor.as_deref() {
                None => true,
                Some(cursor) => cursor.is_empty() || cursor == END_CURSOR,
            }
    }
}

/// Parse a page body: `{"data": [...], "next_cursor": ".."}` or a bare array.
/// Anything else is a `MalformedPage`.
pub fn parse_page(body: &str) -> Result<CatalogPage> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Error::malformed_page(format!("invalid JSON: {e}")))?;
    match value {
        Value::Array(entries) => Ok(CatalogPage {
            entries,
            next_cursor: None,
        }),
        Value::Object(mut obj) => {
            let entries = match obj.remove("data") {
                Some(Value::Array(entries)) => entries,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(Error::malformed_page(format!(
                        "`data` is not an array: {other}"
                    )))
                }
            };
            let next_cursor = match obj.remove("next_cursor") {
                Some(Value::String(s)) => Some(s),
                Some(Value::Null) | None => None,
                Some(other) => {
                    return Err(Error::malformed_page(format!(
                        "`next_cursor` is not a string: {other}"
                    )))
                }
            };
            Ok(CatalogPage {
                entries,
                next_cursor,
            })
        }
        other => Err(Error::malformed_page(format!(
            "unexpected page shape: {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Upstream catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the page at `cursor` (`None` for the first page).
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage>;
}

/// Catalog served over HTTP.
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpCatalogSource {
    pub fn new(endpoints: &Endpoints, credentials: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(endpoints.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: endpoints.catalog_url.clone(),
            api_key: credentials.api_key.clone(),
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage> {
        let mut request = self.client.get(&self.url);
        if let Some(cursor) = cursor {
            request = request.query(&[("next_cursor", cursor)]);
        }
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transient(format!("GET {}: {e}", self.url)))?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transient(format!("GET {}: HTTP {status}", self.url)));
        }
        if !status.is_success() {
            return Err(Error::upstream(format!("GET {}: HTTP {status}", self.url)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient(format!("GET {}: reading body: {e}", self.url)))?;
        parse_page(&body)
    }
}

/// Outcome of one catalog fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchReport {
    pub batch: BatchRef,
    /// Pages requested.
    pub pages: usize,
    /// Records written.
    pub records: usize,
    /// Entries that could not be normalized.
    pub malformed: usize,
    /// Entries whose condition id was already seen on an earlier page.
    pub duplicates: usize,
}

/// Paginates the catalog to completion and stages the snapshot.
pub struct CatalogFetcher {
    source: Arc<dyn CatalogSource>,
    staging: StagingStore,
    retry: RetryPolicy,
    budget: Duration,
    max_pages: Option<usize>,
}

#[derive(Default)]
struct Collected {
    records: Vec<MarketSnapshotRecord>,
    pages: usize,
    malformed: usize,
    duplicates: usize,
}

impl CatalogFetcher {
    pub fn new(source: Arc<dyn CatalogSource>, staging: StagingStore, config: &FetchConfig) -> Self {
        Self {
            source,
            staging,
            retry: RetryPolicy::from(&config.page_retry),
            budget: config.budget(),
            max_pages: config.max_pages,
        }
    }

    /// Fetch every page and publish the `catalog` batch for `run`.
    pub async fn fetch(&self, run: &RunKey) -> Result<FetchReport> {
        let collected = tokio::time::timeout(self.budget, self.collect(run))
            .await
            .map_err(|_| {
                Error::deadline(format!(
                    "catalog fetch for {run} exceeded {}s",
                    self.budget.as_secs()
                ))
            })??;

        let batch = self
            .staging
            .publish(run, BatchName::Catalog, &collected.records)?;
        info!(
            run = %run,
            pages = collected.pages,
            records = collected.records.len(),
            malformed = collected.malformed,
            duplicates = collected.duplicates,
            "catalog fetched"
        );
        Ok(FetchReport {
            batch,
            pages: collected.pages,
            records: collected.records.len(),
            malformed: collected.malformed,
            duplicates: collected.duplicates,
        })
    }

    async fn collect(&self, run: &RunKey) -> Result<Collected> {
        let source: &dyn CatalogSource = self.source.as_ref();
        let mut out = Collected::default();
        let mut seen_ids = HashSet::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            if let Some(max) = self.max_pages {
                if out.pages >= max {
                    return Err(Error::upstream(format!(
                        "catalog did not end within {max} pages"
                    )));
                }
            }

            let page_no = out.pages + 1;
            let current = cursor.as_deref();
            let page = self
                .retry
                .retry_async(move |attempt| {
                    if attempt > 0 {
                        debug!(page = page_no, attempt, "retrying catalog page");
                    }
                    source.fetch_page(current)
                })
                .await
                .map_err(|e| exhausted(&format!("catalog page {page_no}"), e))?;
            out.pages += 1;

            let fetched_at = Utc::now();
            for entry in &page.entries {
                match normalize_market(entry, fetched_at) {
                    Ok(record) => {
                        if seen_ids.insert(record.condition_id.clone()) {
                            out.records.push(record);
                        } else {
                            out.duplicates += 1;
                        }
                    }
                    Err(e) => {
                        out.malformed += 1;
                        warn!(run = %run, page = page_no, error = %e, "skipping catalog entry");
                    }
                }
            }
            debug!(run = %run, page = page_no, entries = page.entries.len(), "catalog page");

            if page.is_last() {
                return Ok(out);
            }
            let next = page.next_cursor.unwrap_or_default();
            if !seen_cursors.insert(next.clone()) {
                return Err(Error::upstream(format!(
                    "pagination cycle: cursor {next:?} returned twice"
                )));
            }
            cursor = Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Catalog served from memory. Scripted failures are consumed before a
    /// page is returned.
    struct FakeCatalog {
        pages: HashMap<Option<String>, CatalogPage>,
        failures: Mutex<VecDeque<Error>>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl FakeCatalog {
        fn new(pages: Vec<(Option<&str>, CatalogPage)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(cursor, page)| (cursor.map(str::to_string), page))
                    .collect(),
                failures: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn fail_next(self, errors: Vec<Error>) -> Self {
            *self.failures.lock().unwrap() = errors.into();
            self
        }
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage> {
            self.calls.lock().unwrap().push(cursor.map(str::to_string));
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.pages
                .get(&cursor.map(str::to_string))
                .cloned()
                .ok_or_else(|| Error::upstream(format!("unknown cursor {cursor:?}")))
        }
    }

    fn entry(id: usize) -> Value {
        json!({
            "condition_id": format!("0x{id:03}"),
            "question": format!("market {id}"),
            "active": true,
            "closed": false,
            "archived": false,
            "accepting_orders": true,
            "tokens": [{"token_id": format!("{id}1"), "outcome": "Yes"}]
        })
    }

    fn page(ids: std::ops::Range<usize>, next: Option<&str>) -> CatalogPage {
        CatalogPage {
            entries: ids.map(entry).collect(),
            next_cursor: next.map(str::to_string),
        }
    }

    fn config() -> FetchConfig {
        let mut config = FetchConfig::default();
        config.page_retry.base_delay_ms = 1;
        config.page_retry.max_delay_ms = 2;
        config.page_retry.jitter_pct = 0.0;
        config
    }

    fn run_key() -> RunKey {
        RunKey::parse("test", "2024-01-01").unwrap()
    }

    #[test]
    fn test_parse_page_shapes() {
        let page = parse_page(r#"{"data": [{"a": 1}], "next_cursor": "MTAw"}"#).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("MTAw"));
        assert!(!page.is_last());

        let page = parse_page(r#"{"data": [{"a": 1}], "next_cursor": "LTE="}"#).unwrap();
        assert!(page.is_last());

        let page = parse_page(r#"[{"a": 1}, {"b": 2}]"#).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.is_last());

        assert!(matches!(parse_page("<html>"), Err(Error::MalformedPage(_))));
        assert!(matches!(parse_page(r#"{"data": 5}"#), Err(Error::MalformedPage(_))));
        assert!(matches!(parse_page("42"), Err(Error::MalformedPage(_))));
    }

    #[tokio::test]
    async fn test_fetch_all_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let source = FakeCatalog::new(vec![
            (None, page(0..10, Some("c1"))),
            (Some("c1"), page(10..20, Some("c2"))),
            (Some("c2"), page(20..25, Some(END_CURSOR))),
        ]);
        let fetcher = CatalogFetcher::new(Arc::new(source), staging.clone(), &config());

        let report = fetcher.fetch(&run_key()).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.records, 25);
        assert_eq!(report.malformed, 0);

        let records: Vec<MarketSnapshotRecord> =
            staging.read(&run_key(), BatchName::Catalog).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.condition_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"0x000"));
        assert_eq!(ids.last(), Some(&"0x024"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            FakeCatalog::new(vec![(None, page(0..3, None))])
                .fail_next(vec![Error::transient("reset"), Error::malformed_page("html")]),
        );
        let fetcher = CatalogFetcher::new(source.clone(), StagingStore::new(dir.path()), &config());

        let report = fetcher.fetch(&run_key()).await.unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(source.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_page_is_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path());
        let mut cfg = config();
        cfg.page_retry.max_attempts = 2;
        let source = FakeCatalog::new(vec![(None, page(0..3, None))])
            .fail_next(vec![Error::transient("a"), Error::transient("b")]);
        let fetcher = CatalogFetcher::new(Arc::new(source), staging.clone(), &cfg);

        let err = fetcher.fetch(&run_key()).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(ref m) if m.starts_with("catalog page 1")));
        assert!(!staging.exists(&run_key(), BatchName::Catalog));
    }

    #[tokio::test]
    async fn test_malformed_and_duplicate_entries_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = page(0..3, Some("c1"));
        first.entries.push(json!({"question": "no id"}));
        let second = page(2..4, None);
        let source = FakeCatalog::new(vec![(None, first), (Some("c1"), second)]);
        let fetcher = CatalogFetcher::new(Arc::new(source), StagingStore::new(dir.path()), &config());

        let report = fetcher.fetch(&run_key()).await.unwrap();
        assert_eq!(report.records, 4);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeCatalog::new(vec![
            (None, page(0..2, Some("c1"))),
            (Some("c1"), page(2..4, Some("c1"))),
        ]);
        let fetcher = CatalogFetcher::new(Arc::new(source), StagingStore::new(dir.path()), &config());

        let err = fetcher.fetch(&run_key()).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(ref m) if m.contains("cycle")));
    }

    #[tokio::test]
    async fn test_max_pages_guard() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeCatalog::new(vec![
            (None, page(0..2, Some("c1"))),
            (Some("c1"), page(2..4, Some("c2"))),
        ]);
        let mut cfg = config();
        cfg.max_pages = Some(1);
        let fetcher = CatalogFetcher::new(Arc::new(source), StagingStore::new(dir.path()), &cfg);

        assert!(matches!(
            fetcher.fetch(&run_key()).await,
            Err(Error::Upstream(_))
        ));
    }

    struct SlowCatalog;

    #[async_trait]
    impl CatalogSource for SlowCatalog {
        async fn fetch_page(&self, _cursor: Option<&str>) -> Result<CatalogPage> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(CatalogPage::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.budget_secs = 5;
        let fetcher = CatalogFetcher::new(Arc::new(SlowCatalog), StagingStore::new(dir.path()), &cfg);

        assert!(matches!(
            fetcher.fetch(&run_key()).await,
            Err(Error::DeadlineExceeded(_))
        ));
    }
}
