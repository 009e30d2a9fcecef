//! Per-run status report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipeline_core::{RunKey, StageName};

/// Final status of one stage in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Ran and wrote its completion marker.
    Completed,
    /// Already completed by an earlier run.
    Skipped,
    /// Ran out of attempts or hit a non-retryable error.
    Failed,
    /// Not attempted because an upstream stage failed.
    Blocked,
}

impl StageStatus {
    /// Whether the stage's output is available to dependents.
    pub fn is_done(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageName,
    pub status: StageStatus,
    /// Attempts made by this run (for skipped stages, by the completing run).
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The stage's own report when it completed or was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<serde_json::Value>,
}

impl StageOutcome {
    pub(crate) fn blocked(stage: StageName, upstream: StageName) -> Self {
        Self {
            stage,
            status: StageStatus::Blocked,
            attempts: 0,
            duration_ms: 0,
            error: Some(format!("upstream stage {upstream} did not complete")),
            report: None,
        }
    }
}

/// Report of one `run` invocation, in stage declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: RunKey,
    pub forced: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    /// True when every stage completed or was skipped.
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_done())
    }

    pub fn outcome(&self, stage: StageName) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn status(&self, stage: StageName) -> Option<StageStatus> {
        self.outcome(stage).map(|s| s.status)
    }
}
