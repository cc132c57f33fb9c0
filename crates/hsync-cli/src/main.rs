use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hsync_core::Status;
use hsync_storage::{DocumentStore, MemoryStore};
use hsync_sync::{
    connect_store, display_count, run_sync_once, run_sync_once_from_env, scrape_to_file,
    RunOutcome, RunSummary, SyncConfig, SyncEngine, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hsync")]
#[command(about = "Scrape hackathon listings and sync them to the remote document store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch listings from the source and write the interchange file.
    Scrape {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Purge stale documents, then upload allowed records from the interchange file.
    Upload {
        #[arg(long)]
        input: Option<PathBuf>,
        /// Sync against an in-memory store instead of the remote one.
        #[arg(long)]
        dry_run: bool,
    },
    /// Scrape, then upload.
    Run {
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete every document whose status matches.
    Purge {
        #[arg(long = "status", required = true)]
        statuses: Vec<String>,
    },
    /// Delete every document in the collection.
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },
    Count,
    /// Run scrape + upload on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        let summary = run_sync_once_from_env().await?;
        print_summary(&summary);
        return Ok(());
    };
    let config = SyncConfig::from_env().context("loading configuration")?;

    match command {
        Commands::Scrape { output } => {
            let output = output.unwrap_or_else(|| config.input_path.clone());
            let report = scrape_to_file(&config, &output).await?;
            for (status, scrape) in &report.per_status {
                println!(
                    "{status}: pages={} records={} stopped={:?}",
                    scrape.pages, scrape.records, scrape.stopped
                );
            }
            println!("scrape complete: {} records -> {}", report.total_records, output.display());
        }
        Commands::Upload { input, dry_run } => {
            let mut config = config;
            if let Some(input) = input {
                config.input_path = input;
            }
            let summary = if dry_run {
                config.require_input()?;
                let store = store_for(&config, true)?;
                SyncPipeline::new(config, store).run_once().await
            } else {
                run_sync_once(config).await?
            };
            print_summary(&summary);
        }
        Commands::Run { dry_run } => {
            let store = store_for(&config, dry_run)?;
            let summary = SyncPipeline::new(config, store).run_with_scrape().await;
            print_summary(&summary);
        }
        Commands::Purge { statuses } => {
            let statuses = statuses.iter().map(|s| Status::parse(s)).collect::<Vec<_>>();
            let engine = engine_for(&config)?;
            match engine.delete_by_status(&statuses).await {
                Ok(deleted) => println!("purge complete: deleted={deleted}"),
                Err(err) => eprintln!("purge stopped: {err}"),
            }
        }
        Commands::DeleteAll { yes } => {
            if !yes {
                bail!("refusing to delete every document in {:?} without --yes", config.collection);
            }
            let engine = engine_for(&config)?;
            match engine.delete_all().await {
                Ok(deleted) => println!("delete-all complete: deleted={deleted}"),
                Err(err) => eprintln!("delete-all stopped: {err}"),
            }
        }
        Commands::Count => {
            let engine = engine_for(&config)?;
            println!("{}", display_count(engine.count().await));
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set HSYNC_SCHEDULER_ENABLED=true");
            }
            let cron = config.sync_cron.clone();
            let store = store_for(&config, false)?;
            let pipeline = Arc::new(SyncPipeline::new(config, store));
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn store_for(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn DocumentStore>> {
    if dry_run {
        info!(collection = %config.collection, "dry run: using in-memory store");
        return Ok(Arc::new(MemoryStore::new(config.collection.clone())));
    }
    Ok(connect_store(config)?)
}

fn engine_for(config: &SyncConfig) -> Result<SyncEngine> {
    Ok(SyncEngine::new(connect_store(config)?).with_batch_size(config.batch_size))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync {}: run_id={} collection={}",
        summary.outcome, summary.run_id, summary.collection
    );
    if let Some(scraped) = summary.scraped {
        println!("  scraped: {scraped}");
    }
    println!(
        "  documents before={} after={}",
        display_count(summary.initial_count),
        display_count(summary.final_count)
    );
    println!("  stale deleted: {}", summary.stale_deleted);
    if matches!(summary.outcome, RunOutcome::Completed) {
        println!(
            "  loaded={} eligible={} duplicates removed={}",
            summary.loaded, summary.eligible, summary.duplicates_removed
        );
        for (status, count) in &summary.status_distribution {
            println!("    {status}: {count}");
        }
    }
    println!(
        "  total={} added={} updated={} errors={}",
        summary.upsert.total, summary.upsert.created, summary.upsert.updated, summary.upsert.failed
    );
    if let Some(dir) = &summary.reports_dir {
        println!("  reports: {dir}");
    }
}
