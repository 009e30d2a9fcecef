//! Stage execution.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use pipeline_core::{
    BatchName, Error, MarketSnapshotRecord, OrderBookRecord, Result, RunConfig, RunKey, StageName,
};
use pipeline_ingestion::{
    CatalogFetcher, CatalogSource, FeedConnector, HttpCatalogSource, OpenSetFilter,
    OrderBookStreamer, WsConnector,
};
use pipeline_staging::StagingStore;
use pipeline_store::{PersistentStore, ResumableUploader, SqliteStore};

/// Runs a single stage for a run and returns its report.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, run: &RunKey, stage: StageName) -> Result<serde_json::Value>;
}

/// The production stage set.
pub struct Pipeline {
    fetcher: CatalogFetcher,
    filter: OpenSetFilter,
    uploader: ResumableUploader,
    streamer: OrderBookStreamer,
    stop: watch::Receiver<bool>,
}

impl Pipeline {
    /// Assemble the stages over explicit upstream and store handles.
    /// Setting `stop` ends the streaming window early.
    pub fn new(
        config: &RunConfig,
        source: Arc<dyn CatalogSource>,
        connector: Arc<dyn FeedConnector>,
        store: Arc<dyn PersistentStore>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let staging = StagingStore::from_config(&config.staging);
        Self {
            fetcher: CatalogFetcher::new(source, staging.clone(), &config.fetch),
            filter: OpenSetFilter::new(staging.clone()),
            uploader: ResumableUploader::new(staging.clone(), store, config.upload.clone()),
            streamer: OrderBookStreamer::new(connector, staging, config.stream.clone()),
            stop,
        }
    }

    /// HTTP catalog, WebSocket feed and the SQLite store from `config`.
    pub fn from_config(config: &RunConfig, stop: watch::Receiver<bool>) -> Result<Self> {
        let source = HttpCatalogSource::new(&config.endpoints, &config.credentials)?;
        let connector = WsConnector::new(config.endpoints.feed_url.clone());
        let store = SqliteStore::from_config(&config.store)?;
        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(connector),
            Arc::new(store),
            stop,
        ))
    }
}

fn to_report<T: Serialize>(report: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(report)?)
}

#[async_trait]
impl StageRunner for Pipeline {
    async fn run_stage(&self, run: &RunKey, stage: StageName) -> Result<serde_json::Value> {
        match stage {
            StageName::FetchCatalog => to_report(self.fetcher.fetch(run).await?),
            StageName::FilterOpen => {
                let filter = self.filter.clone();
                let run = run.clone();
                let report = tokio::task::spawn_blocking(move || filter.filter(&run))
                    .await
                    .map_err(|e| Error::Other(format!("filter task failed: {e}")))??;
                to_report(report)
            }
            StageName::UploadMarkets => to_report(
                self.uploader
                    .upload::<MarketSnapshotRecord>(run, BatchName::OpenMarkets)
                    .await?,
            ),
            StageName::StreamOrderBooks => {
                to_report(self.streamer.stream(run, self.stop.clone()).await?)
            }
            StageName::UploadOrderBooks => to_report(
                self.uploader
                    .upload::<OrderBookRecord>(run, BatchName::OrderBooks)
                    .await?,
            ),
        }
    }
}
