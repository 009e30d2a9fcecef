//! Upstream ingestion for the market pipeline.
//!
//! This crate handles:
//! - Catalog pagination and record normalization
//! - The open-market filter
//! - Concurrent order book streaming into staging segments

pub mod catalog;
pub mod filter;
pub mod normalize;
pub mod stream;

pub use catalog::{CatalogFetcher, CatalogPage, CatalogSource, FetchReport, HttpCatalogSource};
pub use filter::{FilterReport, OpenSetFilter};
pub use normalize::normalize_market;
pub use stream::{
    FeedConnector, FeedFrame, FeedTransport, OrderBookStreamer, SessionState, SessionStats,
    StreamReport, WsConnector,
};
