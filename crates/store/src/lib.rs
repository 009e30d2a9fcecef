//! Persistent store for the market pipeline.
//!
//! This crate handles:
//! - The store seam and its SQLite implementation
//! - Resumable, idempotent upload of staging batches

pub mod sqlite;
pub mod store;
pub mod uploader;

pub use sqlite::SqliteStore;
pub use store::{PersistentStore, UploadCursor, UpsertCounts};
pub use uploader::{ResumableUploader, UploadReport, Uploadable};
