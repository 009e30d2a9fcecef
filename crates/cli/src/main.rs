//! market-pipeline: run trigger and read path for the ingestion pipeline.
//!
//! Commands:
//! - `run`: execute (or resume) the stage DAG for one environment and date
//! - `book`: print the latest stored order book for a token
//! - `unlock`: remove a run lock left behind by a crashed process

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipeline_core::{parse_logical_date, RunConfig};
use pipeline_orchestrator::{Pipeline, PipelineOrchestrator, RunOptions};
use pipeline_staging::RunLock;
use pipeline_store::{PersistentStore, SqliteStore};

#[derive(Parser)]
#[command(
    name = "market-pipeline",
    about = "Prediction-market catalog and order book ingestion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every incomplete stage for one environment and logical date.
    Run {
        /// Environment name (e.g. test, staging, prod).
        #[arg(long)]
        env: String,

        /// Logical date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Clear completion markers first and rerun every stage.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Path to a JSON config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the latest stored order book for a token as JSON.
    Book {
        /// Outcome token id.
        token_id: String,

        /// Path to a JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove a stale run lock for an environment.
    Unlock {
        #[arg(long)]
        env: String,

        /// Path to a JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

async fn run(
    env: String,
    date: String,
    force: bool,
    config_path: Option<PathBuf>,
) -> Result<bool> {
    let mut config = load_config(config_path.as_ref())?;
    config.environment = env.clone();
    let logical_date = parse_logical_date(&date)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, ending the streaming window");
            let _ = stop_tx.send(true);
        }
    });

    let pipeline = Pipeline::from_config(&config, stop_rx)?;
    let orchestrator = PipelineOrchestrator::new(config, Arc::new(pipeline));
    let report = orchestrator
        .run(&env, logical_date, RunOptions { force })
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.succeeded())
}

fn book(token_id: &str, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let store = SqliteStore::from_config(&config.store)?;
    match store.latest_order_book(token_id)? {
        Some(book) => println!("{}", serde_json::to_string_pretty(&book)?),
        None => bail!("no order book stored for token {token_id}"),
    }
    Ok(())
}

fn unlock(env: &str, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    if RunLock::break_stale(&config.staging.root, env)? {
        info!(environment = env, "lock removed");
    } else {
        info!(environment = env, "no lock held");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            env,
            date,
            force,
            config,
        } => run(env, date, force, config).await,
        Commands::Book { token_id, config } => book(&token_id, config).map(|_| true),
        Commands::Unlock { env, config } => unlock(&env, config).map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
