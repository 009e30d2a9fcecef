//! Per-stage completion markers.
//!
//! A marker is written only after a stage's side effects are durable; its
//! presence is what lets a rerun skip the stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use pipeline_core::{Error, Result, RunKey, StageName};

use crate::fsutil::atomic_write;
use crate::store::StagingStore;

const MARKER_DIR: &str = "_markers";

/// Durable record that a stage finished for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub run: RunKey,
    pub stage: StageName,
    pub completed_at: DateTime<Utc>,
    /// Attempts the stage needed, including the successful one.
    pub attempts: u32,
    /// The stage's own report.
    pub report: serde_json::Value,
}

/// Completion markers stored next to the run's staging batches.
#[derive(Debug, Clone)]
pub struct CompletionLedger {
    staging: StagingStore,
}

impl CompletionLedger {
    pub fn new(staging: StagingStore) -> Self {
        Self { staging }
    }

    fn marker_dir(&self, run: &RunKey) -> PathBuf {
        self.staging.run_dir(run).join(MARKER_DIR)
    }

    fn marker_path(&self, run: &RunKey, stage: StageName) -> PathBuf {
        self.marker_dir(run).join(format!("{}.json", stage.as_str()))
    }

    pub fn mark_complete<T: Serialize>(
        &self,
        run: &RunKey,
        stage: StageName,
        attempts: u32,
        report: &T,
    ) -> Result<CompletionMarker> {
        let marker = CompletionMarker {
            run: run.clone(),
            stage,
            completed_at: Utc::now(),
            attempts,
            report: serde_json::to_value(report)?,
        };
        atomic_write(
            &self.marker_path(run, stage),
            &serde_json::to_vec_pretty(&marker)?,
        )?;
        info!(run = %run, stage = %stage, attempts, "stage marked complete");
        Ok(marker)
    }

    pub fn marker(&self, run: &RunKey, stage: StageName) -> Result<Option<CompletionMarker>> {
        let path = self.marker_path(run, stage);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let marker = serde_json::from_slice(&raw)
            .map_err(|e| Error::corrupt_batch(format!("{}: {e}", path.display())))?;
        Ok(Some(marker))
    }

    pub fn is_complete(&self, run: &RunKey, stage: StageName) -> Result<bool> {
        Ok(self.marker_path(run, stage).is_file())
    }

    /// Drop every marker of a run. Returns how many were removed.
    pub fn clear(&self, run: &RunKey) -> Result<usize> {
        let mut removed = 0;
        for stage in StageName::ALL {
            let path = self.marker_path(run, stage);
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(run = %run, removed, "cleared completion markers");
        }
        Ok(removed)
    }
}
