//! Stage DAG evaluation with completion markers and bounded retries.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use pipeline_core::{BatchName, Error, Result, RunConfig, RunKey, StageName};
use pipeline_staging::{CompletionLedger, RunLock, StagingStore};

use crate::report::{RunReport, StageOutcome, StageStatus};
use crate::stages::StageRunner;

/// Catalog chain: each stage consumes the previous stage's batch.
pub const MARKET_CHAIN: [StageName; 3] = [
    StageName::FetchCatalog,
    StageName::FilterOpen,
    StageName::UploadMarkets,
];

/// Order book chain, independent of the catalog chain.
pub const BOOK_CHAIN: [StageName; 2] = [StageName::StreamOrderBooks, StageName::UploadOrderBooks];

/// Per-invocation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Clear the run's completion markers and unsealed segments first, so
    /// every stage runs again.
    pub force: bool,
}

pub struct PipelineOrchestrator {
    config: RunConfig,
    staging: StagingStore,
    ledger: CompletionLedger,
    runner: Arc<dyn StageRunner>,
}

impl PipelineOrchestrator {
    pub fn new(config: RunConfig, runner: Arc<dyn StageRunner>) -> Self {
        let staging = StagingStore::from_config(&config.staging);
        Self {
            ledger: CompletionLedger::new(staging.clone()),
            staging,
            config,
            runner,
        }
    }

    pub fn ledger(&self) -> &CompletionLedger {
        &self.ledger
    }

    /// Evaluate the stage DAG for `(environment, logical_date)`.
    ///
    /// Configuration problems and a held environment lock fail the whole call
    /// before any stage runs. Stage failures do not; they are reported per
    /// stage in the returned [`RunReport`].
    pub async fn run(
        &self,
        environment: &str,
        logical_date: NaiveDate,
        options: RunOptions,
    ) -> Result<RunReport> {
        self.config.validate()?;
        let run = RunKey::new(environment, logical_date)?;
        let _lock = RunLock::acquire(
            self.staging.root(),
            &run,
            self.config.orchestrator.lock_max_age(),
        )?;
        let started_at = Utc::now();
        info!(run = %run, force = options.force, "pipeline run starting");

        if options.force {
            self.ledger.clear(&run)?;
            self.staging.clear_segments(&run, BatchName::OrderBooks)?;
        }

        let (markets, books) = tokio::join!(
            self.run_chain(&run, &MARKET_CHAIN),
            self.run_chain(&run, &BOOK_CHAIN)
        );
        let mut stages: Vec<StageOutcome> = markets.into_iter().chain(books).collect();
        stages.sort_by_key(|s| s.stage);

        let report = RunReport {
            run: run.clone(),
            forced: options.force,
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        if report.succeeded() {
            info!(run = %run, "pipeline run succeeded");
        } else {
            let failed: Vec<&str> = report
                .stages
                .iter()
                .filter(|s| !s.status.is_done())
                .map(|s| s.stage.as_str())
                .collect();
            warn!(run = %run, ?failed, "pipeline run finished with failures");
        }
        Ok(report)
    }

    async fn run_chain(&self, run: &RunKey, chain: &[StageName]) -> Vec<StageOutcome> {
        let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(chain.len());
        for &stage in chain {
            let upstream_failed = outcomes
                .last()
                .filter(|prev| !prev.status.is_done())
                .map(|prev| prev.stage);
            let outcome = match upstream_failed {
                Some(upstream) => {
                    warn!(run = %run, stage = %stage, upstream = %upstream, "stage blocked");
                    StageOutcome::blocked(stage, upstream)
                }
                None => self.run_stage(run, stage).await,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_stage(&self, run: &RunKey, stage: StageName) -> StageOutcome {
        match self.ledger.marker(run, stage) {
            Ok(Some(marker)) => {
                info!(run = %run, stage = %stage, completed_at = %marker.completed_at, "stage already complete, skipping");
                return StageOutcome {
                    stage,
                    status: StageStatus::Skipped,
                    attempts: marker.attempts,
                    duration_ms: 0,
                    error: None,
                    report: Some(marker.report),
                };
            }
            Ok(None) => {}
            Err(e) => return failed(stage, 0, 0, &e),
        }

        let max_attempts = self.config.orchestrator.stage_max_attempts.max(1);
        let retry_delay = self.config.orchestrator.stage_retry_delay();
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(run = %run, stage = %stage, attempt, "stage starting");
            let err = match self.runner.run_stage(run, stage).await {
                Ok(report) => match self.ledger.mark_complete(run, stage, attempt, &report) {
                    Ok(_) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        info!(run = %run, stage = %stage, attempt, duration_ms, "stage completed");
                        return StageOutcome {
                            stage,
                            status: StageStatus::Completed,
                            attempts: attempt,
                            duration_ms,
                            error: None,
                            report: Some(report),
                        };
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            if !err.is_stage_retryable() || attempt >= max_attempts {
                error!(run = %run, stage = %stage, attempt, error = %err, "stage failed");
                return failed(stage, attempt, elapsed_ms, &err);
            }
            warn!(
                run = %run,
                stage = %stage,
                attempt,
                max_attempts,
                error = %err,
                "stage attempt failed, retrying"
            );
            tokio::time::sleep(retry_delay).await;
        }
    }
}

fn failed(stage: StageName, attempts: u32, duration_ms: u64, err: &Error) -> StageOutcome {
    StageOutcome {
        stage,
        status: StageStatus::Failed,
        attempts,
        duration_ms,
        error: Some(err.to_string()),
        report: None,
    }
}
