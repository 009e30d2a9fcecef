//! Stage sequencing for the market pipeline.
//!
//! ```text
//! fetch_catalog -> filter_open -> upload_markets
//! stream_order_books -> upload_order_books
//! ```
//!
//! The two chains run concurrently; stages within a chain run in order.

pub mod orchestrator;
pub mod report;
pub mod stages;

pub use orchestrator::{PipelineOrchestrator, RunOptions, BOOK_CHAIN, MARKET_CHAIN};
pub use report::{RunReport, StageOutcome, StageStatus};
pub use stages::{Pipeline, StageRunner};
