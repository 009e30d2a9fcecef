//! Durable hand-off area between pipeline stages.
//!
//! Batches are JSON-lines files scoped by environment and logical date:
//!
//! ```text
//! <root>/<environment>/.run.lock
//! <root>/<environment>/<date>/<batch>.jsonl
//! <root>/<environment>/<date>/<batch>.seg/<n>.jsonl
//! <root>/<environment>/<date>/_markers/<stage>.json
//! ```

mod fsutil;
pub mod ledger;
pub mod lock;
pub mod store;

pub use ledger::{CompletionLedger, CompletionMarker};
pub use lock::RunLock;
pub use store::{BatchRef, LoadedBatch, SegmentRef, StagingStore};
