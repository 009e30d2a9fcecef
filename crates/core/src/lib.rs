//! Core types and configuration for the market pipeline.
//!
//! This crate provides shared types used across all other crates:
//! - Run identity and record types (market snapshots, order books)
//! - Run configuration structures
//! - The pipeline error taxonomy
//! - Retry and backoff policy

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use types::*;
