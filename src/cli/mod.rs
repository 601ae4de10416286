//! Command-line interface for trapline.
//!
//! Provides operational commands for dispatching a job's task manifest,
//! inspecting progress and cleaning up a job's broker and progress
//! resources. Worker pools and the status monitor need external
//! collaborators (the image pipeline, the task executor) and are embedded
//! via the library API instead.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::broker::{ProviderRegistry, TaskQueueCoordinator};
use crate::config::Config;
use crate::dispatch::{tasks_from_manifest, JobDispatcher};
use crate::progress::ProgressTracker;

/// Concurrency-context key for the CLI's single broker connection.
const CLI_CONTEXT: &str = "cli";

/// trapline: distributed image-task dispatch and job reconciliation.
#[derive(Debug, Parser)]
#[command(name = "trapline", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL for the broker and progress store.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Publish a job's task manifest and initialize progress tracking.
    Dispatch {
        /// Job identifier.
        #[arg(long)]
        job_id: String,
        /// Path to a JSON manifest (array of task records).
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Show the current progress of a job.
    Progress {
        /// Job identifier.
        #[arg(long)]
        job_id: String,
        /// Optional processing stage.
        #[arg(long)]
        stage: Option<String>,
    },
    /// Delete a job's queue resources and progress keys.
    Cleanup {
        /// Job identifier.
        #[arg(long)]
        job_id: String,
    },
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }

    match cli.command {
        Commands::Dispatch { job_id, manifest } => dispatch(&config, &job_id, &manifest).await,
        Commands::Progress { job_id, stage } => progress(&config, &job_id, stage.as_deref()).await,
        Commands::Cleanup { job_id } => cleanup(&config, &job_id).await,
    }
}

/// Builds the coordinator + tracker pair the dispatcher needs.
async fn build_dispatcher(config: &Config) -> anyhow::Result<(JobDispatcher, Arc<ProviderRegistry>)> {
    let registry = Arc::new(ProviderRegistry::new(config.redis_url.clone()));
    let provider = registry.provider_for(CLI_CONTEXT);
    let coordinator =
        TaskQueueCoordinator::new(provider, CLI_CONTEXT, config.redelivery_timeout);
    coordinator
        .connect()
        .await
        .context("broker unreachable")?;

    let tracker = ProgressTracker::connect(&config.redis_url, config.pending_ttl, config.lock_ttl)
        .await
        .context("progress store unreachable")?;

    Ok((JobDispatcher::new(coordinator, tracker), registry))
}

async fn dispatch(config: &Config, job_id: &str, manifest_path: &PathBuf) -> anyhow::Result<()> {
    let manifest = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let tasks = tasks_from_manifest(&manifest)?;

    let (dispatcher, registry) = build_dispatcher(config).await?;
    dispatcher.dispatch(job_id, &tasks).await?;
    registry.close_all().await;

    println!("Dispatched {} tasks for job {}", tasks.len(), job_id);
    Ok(())
}

async fn progress(config: &Config, job_id: &str, stage: Option<&str>) -> anyhow::Result<()> {
    let tracker = ProgressTracker::connect(&config.redis_url, config.pending_ttl, config.lock_ttl)
        .await
        .context("progress store unreachable")?;

    match tracker.get_progress(job_id, stage).await? {
        Some(progress) => {
            println!(
                "job {}: {}/{} processed ({:.1}%), {} remaining",
                job_id,
                progress.processed,
                progress.total,
                progress.percentage * 100.0,
                progress.remaining
            );
        }
        None => {
            println!("job {}: no progress recorded (uninitialized or cleaned up)", job_id);
        }
    }
    Ok(())
}

async fn cleanup(config: &Config, job_id: &str) -> anyhow::Result<()> {
    let (dispatcher, registry) = build_dispatcher(config).await?;
    dispatcher.cancel(job_id).await?;
    registry.close_all().await;

    println!("Cleaned up resources for job {}", job_id);
    Ok(())
}
