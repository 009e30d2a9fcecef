//! Configuration structures for the market pipeline.
//!
//! Every component receives its section of [`RunConfig`] at construction;
//! nothing reads process environment or working-directory state.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{validate_environment, Instrument};

/// Main configuration for one pipeline environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Environment name; becomes part of every run key.
    pub environment: String,
    /// Upstream credentials.
    pub credentials: Credentials,
    /// Upstream endpoints.
    pub endpoints: Endpoints,
    /// Staging area configuration.
    pub staging: StagingConfig,
    /// Persistent store configuration.
    pub store: StoreConfig,
    /// Catalog fetch configuration.
    pub fetch: FetchConfig,
    /// Order book streaming configuration.
    pub stream: StreamConfig,
    /// Upload configuration.
    pub upload: UploadConfig,
    /// Stage scheduling configuration.
    pub orchestrator: OrchestratorConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            environment: "test".to_string(),
            credentials: Credentials::default(),
            endpoints: Endpoints::default(),
            staging: StagingConfig::default(),
            store: StoreConfig::default(),
            fetch: FetchConfig::default(),
            stream: StreamConfig::default(),
            upload: UploadConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load a configuration from a JSON file. Missing sections fall back to
    /// their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Check the configuration before any stage runs.
    pub fn validate(&self) -> Result<()> {
        validate_environment(&self.environment)?;
        self.endpoints.validate()?;
        self.fetch.page_retry.validate("fetch.page_retry")?;
        self.stream.validate()?;
        self.upload.validate()?;
        if self.orchestrator.stage_max_attempts == 0 {
            return Err(Error::config("orchestrator.stage_max_attempts must be at least 1"));
        }
        if self.orchestrator.lock_max_age_secs == 0 {
            return Err(Error::config("orchestrator.lock_max_age_secs must be positive"));
        }
        Ok(())
    }
}

/// Upstream credentials. Redacted in debug output.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// API key sent with catalog requests, if the upstream requires one.
    pub api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Upstream endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Paginated catalog endpoint.
    pub catalog_url: String,
    /// Streaming feed endpoint.
    pub feed_url: String,
    /// Per-request HTTP timeout (ms).
    pub request_timeout_ms: u64,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            catalog_url: "https://clob.polymarket.com/markets".to_string(),
            feed_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl Endpoints {
    fn validate(&self) -> Result<()> {
        if !(self.catalog_url.starts_with("http://") || self.catalog_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "endpoints.catalog_url must be an http(s) URL, got {:?}",
                self.catalog_url
            )));
        }
        if !(self.feed_url.starts_with("ws://") || self.feed_url.starts_with("wss://")) {
            return Err(Error::config(format!(
                "endpoints.feed_url must be a ws(s) URL, got {:?}",
                self.feed_url
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Staging area configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root directory; batches live under `<root>/<environment>/<date>/`.
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage/staging"),
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("storage/markets.sqlite"),
        }
    }
}

/// Retry settings shared by several sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: usize,
    /// Delay before the first retry (ms).
    pub base_delay_ms: u64,
    /// Delay cap (ms).
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay.
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_pct: 0.2,
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(format!("{section}.max_attempts must be at least 1")));
        }
        if !(0.0..=1.0).contains(&self.jitter_pct) {
            return Err(Error::config(format!("{section}.jitter_pct must be within [0, 1]")));
        }
        Ok(())
    }
}

/// Catalog fetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Retry policy applied to each page request.
    pub page_retry: RetryConfig,
    /// Wall-clock budget for the whole fetch (seconds).
    pub budget_secs: u64,
    /// Safety cap on the number of pages.
    pub max_pages: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_retry: RetryConfig::default(),
            budget_secs: 900,
            max_pages: None,
        }
    }
}

impl FetchConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

/// Order book streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Explicit instruments to stream.
    pub instruments: Vec<Instrument>,
    /// Also stream every market in the open-markets batch of this date
    /// (same environment).
    pub instruments_from_date: Option<NaiveDate>,
    /// Cap on the number of instruments.
    pub max_instruments: Option<usize>,
    /// Maximum concurrently open connections.
    pub max_concurrency: usize,
    /// Streaming duration (seconds).
    pub duration_secs: u64,
    /// Silence longer than this forces a reconnect (ms).
    pub liveness_timeout_ms: u64,
    /// Keepalive interval (ms).
    pub ping_interval_ms: u64,
    /// Reconnect backoff; `max_attempts` is ignored (reconnects are unbounded).
    pub reconnect: RetryConfig,
    /// Flush buffered records at least this often (ms).
    pub flush_interval_ms: u64,
    /// Flush once this many records are buffered.
    pub flush_max_records: usize,
    /// Levels kept per side in each record.
    pub max_book_depth: usize,
    /// Capacity of the session → sink channel.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            instruments_from_date: None,
            max_instruments: None,
            max_concurrency: 16,
            duration_secs: 60,
            liveness_timeout_ms: 30_000,
            ping_interval_ms: 10_000,
            reconnect: RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_pct: 0.25,
            },
            flush_interval_ms: 5_000,
            flush_max_records: 1_000,
            max_book_depth: 20,
            channel_capacity: 4_096,
        }
    }
}

impl StreamConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::config("stream.max_concurrency must be at least 1"));
        }
        if self.flush_max_records == 0 || self.channel_capacity == 0 {
            return Err(Error::config(
                "stream.flush_max_records and stream.channel_capacity must be positive",
            ));
        }
        if self.liveness_timeout_ms == 0 || self.flush_interval_ms == 0 || self.ping_interval_ms == 0 {
            return Err(Error::config("stream intervals must be positive"));
        }
        if self.ping_interval_ms >= self.liveness_timeout_ms {
            return Err(Error::config(
                "stream.ping_interval_ms must be shorter than stream.liveness_timeout_ms",
            ));
        }
        if self.reconnect.jitter_pct < 0.0 || self.reconnect.jitter_pct > 1.0 {
            return Err(Error::config("stream.reconnect.jitter_pct must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Records per store transaction.
    pub chunk_size: usize,
    /// Retry policy per chunk.
    pub retry: RetryConfig,
    /// Wall-clock budget for one upload (seconds).
    pub budget_secs: u64,
    /// Skip records already covered by the upload cursor.
    pub use_cursor: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            retry: RetryConfig::default(),
            budget_secs: 900,
            use_cursor: true,
        }
    }
}

impl UploadConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("upload.chunk_size must be at least 1"));
        }
        self.retry.validate("upload.retry")
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

/// Stage scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per stage including the first.
    pub stage_max_attempts: u32,
    /// Fixed delay between stage attempts (ms).
    pub stage_retry_delay_ms: u64,
    /// A run lock older than this is treated as abandoned (seconds).
    pub lock_max_age_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_max_attempts: 3,
            stage_retry_delay_ms: 5_000,
            lock_max_age_secs: 6 * 3_600,
        }
    }
}

impl OrchestratorConfig {
    pub fn stage_retry_delay(&self) -> Duration {
        Duration::from_millis(self.stage_retry_delay_ms)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }
}
