use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lotwatch_storage::ListingStore;
use lotwatch_sync::{CycleReport, CycleRequest, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotwatch")]
#[command(about = "Vehicle listing reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle.
    Sync {
        /// Limit the cycle to these sources (repeatable). Default: every enabled source.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Override the per-source detail page budget.
        #[arg(long)]
        max_details: Option<usize>,
        /// Print the full cycle report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create or upgrade the store schema.
    Migrate,
    /// Serve the reporting API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
    },
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        sources: Vec::new(),
        max_details: None,
        json: false,
    }) {
        Commands::Sync {
            sources,
            max_details,
            json,
        } => {
            let request = CycleRequest {
                sources,
                max_detail_fetches: max_details,
            };
            let report = lotwatch_sync::run_sync_once_from_env(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            if let Some(err) = &report.error {
                anyhow::bail!("cycle {} failed: {err}", report.run_id);
            }
        }
        Commands::Migrate => {
            let store = open_store(&SyncConfig::from_env()).await?;
            store.close().await;
            println!("migrate complete");
        }
        Commands::Serve { bind } => {
            let store = open_store(&SyncConfig::from_env()).await?;
            lotwatch_web::serve(store, bind).await?;
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let store = open_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::from_config(config, store.clone())?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            store.close().await;
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<ListingStore> {
    let store = ListingStore::connect(&config.database_url).await?;
    store.migrate().await.context("migrating listing store")?;
    Ok(store)
}

fn print_summary(report: &CycleReport) {
    println!(
        "sync complete: run_id={} found={} rejected={} new={} updated={} inactivated={} errors={} duration_ms={}",
        report.run_id,
        report.totals.found,
        report.totals.rejected,
        report.totals.new,
        report.totals.updated,
        report.totals.inactivated,
        report.totals.errors,
        report.duration_ms
    );
    for (source, counts) in &report.per_source {
        match &counts.fetch_error {
            Some(err) => println!("  {source}: fetch failed: {err}"),
            None => println!(
                "  {source}: found={} new={} updated={} inactivated={} detail_pages={} dropped={}",
                counts.found,
                counts.new,
                counts.updated,
                counts.inactivated,
                counts.detail_pages_fetched,
                counts.dropped
            ),
        }
    }
}
