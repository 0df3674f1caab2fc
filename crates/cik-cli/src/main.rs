use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cik_core::{RunSummary, PROCESS_NAME};
use cik_source::{FileSnapshotSource, HttpSnapshotSource, SnapshotSource};
use cik_storage::{HttpFetcher, PgRecordStore, RecordStore};
use cik_sync::{SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cik-cli")]
#[command(about = "Company ticker reference sync")]
struct Cli {
    /// YAML config file; falls back to $CIK_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Run {
        /// Reconcile a downloaded document instead of fetching.
        #[arg(long)]
        snapshot_file: Option<PathBuf>,
    },
    /// Run on the configured cron schedule until Ctrl-C.
    Daemon,
    /// Apply pending database migrations.
    Migrate,
    /// Fetch and decode the snapshot without touching the database.
    Fetch {
        #[arg(long)]
        snapshot_file: Option<PathBuf>,
    },
    /// Show when the last pass completed.
    LastRun,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var("CIK_CONFIG").ok().map(PathBuf::from));
    let config = match config_path {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::from_env(),
    };

    match cli.command.unwrap_or(Commands::Run {
        snapshot_file: None,
    }) {
        Commands::Run { snapshot_file } => {
            let store = connect_store(&config).await?;
            let source = build_source(&config, snapshot_file)?;
            let pipeline = SyncPipeline::new(config, source, store);
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            if summary.has_failures() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Daemon => {
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("cik sync is disabled (set CIK_SYNC_ENABLED=true or use-tickers: true)");
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().update_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let pool = cik_storage::connect(&config.database_url).await?;
            cik_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Fetch { snapshot_file } => {
            let source = build_source(&config, snapshot_file)?;
            let snapshot = source.fetch().await?;
            println!(
                "fetched from {}: records={} duplicates={} sha256={}",
                source.describe(),
                snapshot.records.len(),
                snapshot.duplicate_ids,
                snapshot.sha256.as_deref().unwrap_or("-")
            );
        }
        Commands::LastRun => {
            let store = connect_store(&config).await?;
            match store.run_metadata(PROCESS_NAME).await? {
                Some(meta) => {
                    println!("{} last executed at {}", meta.process_name, meta.last_executed_at)
                }
                None => println!("{PROCESS_NAME} has never run"),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn build_source(
    config: &SyncConfig,
    snapshot_file: Option<PathBuf>,
) -> Result<Box<dyn SnapshotSource>> {
    let source: Box<dyn SnapshotSource> = match snapshot_file {
        Some(path) => Box::new(FileSnapshotSource::new(path)),
        None => Box::new(HttpSnapshotSource::new(
            HttpFetcher::new(config.http_client_config())?,
            config.company_tickers_url.clone(),
        )),
    };
    Ok(source)
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    let pool = cik_storage::connect(&config.database_url).await?;
    Ok(Arc::new(PgRecordStore::new(pool)))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} inserted={} updated={} unchanged={} failed={} duplicates={}",
        summary.run_id,
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.failed,
        summary.duplicate_ids
    );
    for failure in &summary.failures {
        println!("  failed cik={}: {}", failure.external_id, failure.error);
    }
}
