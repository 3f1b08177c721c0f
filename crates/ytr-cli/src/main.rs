use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use ytr_ingest::{build_scheduler, IngestConfig, IngestPipeline};

#[derive(Debug, Parser)]
#[command(name = "ytr-cli")]
#[command(about = "YouTube reporting ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingest sweep over every active job, then exit.
    Sweep,
    /// Re-fetch descriptors for jobs whose stored metadata has gone stale.
    RefreshMetadata,
    /// Run both sweeps on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config)?;

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Sweep => {
            let summary = pipeline.run_ingest_sweep().await?;
            println!(
                "sweep complete: run_id={} jobs={} ingested={} skipped={} failed={} rows={}",
                summary.run_id,
                summary.jobs_total,
                summary.reports_ingested,
                summary.reports_skipped,
                summary.reports_failed,
                summary.rows_written
            );
        }
        Commands::RefreshMetadata => {
            let summary = pipeline.run_metadata_refresh().await?;
            println!(
                "metadata refresh complete: run_id={} considered={} refreshed={} failed={}",
                summary.run_id,
                summary.jobs_considered,
                summary.jobs_refreshed,
                summary.jobs_failed
            );
        }
        Commands::Schedule => {
            let mut scheduler = build_scheduler(Arc::new(pipeline), &config).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(
                ingest_cron = %config.ingest_cron,
                metadata_cron = %config.metadata_cron,
                "scheduler running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
