use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use airq_etl::app::ports::SnapshotStore;
use airq_etl::config::Config;
use airq_etl::constants;
use airq_etl::infra::http_client::{OpenAqClient, OpenMeteoClient};
use airq_etl::infra::snapshot_store::{load_snapshots, FsSnapshotStore};
use airq_etl::pipeline::orchestrator::{Orchestrator, RunReport};
use airq_etl::pipeline::transform::Transformer;
use airq_etl::{infra, logging};

#[derive(Parser)]
#[command(name = "airq_etl")]
#[command(about = "Urban air-quality ETL: extract, transform, load, validate")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "airq.toml")]
    config: PathBuf,
    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run,
    /// Only extract, persisting raw snapshots
    Extract,
    /// Rebuild a staged dataset from stored snapshots
    Transform {
        /// Output file for the staged dataset
        #[arg(long, default_value = "data/staged/air_quality_staged.json")]
        output: PathBuf,
    },
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight work and stopping");
            token.cancel();
        }
    });
    cancel
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let timeout = config.sources.timeout();
    let primary = Arc::new(OpenAqClient::new(config.sources.primary_url.clone(), timeout)?);
    let fallback = Arc::new(OpenMeteoClient::new(config.sources.fallback_url.clone(), timeout)?);
    let store = Arc::new(FsSnapshotStore::new(config.snapshots.dir.clone()));
    let sink = infra::build_sink(&config.sink, timeout).context("failed to set up sink")?;
    Ok(Orchestrator::new(config, primary, fallback, store, sink))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("\n📊 Run {} finished: {}", report.run_id, report.state);
    println!("   States: {}", report.transitions.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" → "));
    println!("   Snapshots: {}", report.snapshots.len());
    println!("   Staged rows: {}", report.staged_rows);
    if let Some(load) = &report.load {
        println!("   Inserted: {}/{} rows in {} batches", load.inserted, load.total, load.batches);
    }

    if let Some(reason) = &report.abort_reason {
        println!("\n❌ Aborted: {}", reason);
    }
    if !report.extraction_failures.is_empty() {
        println!("\n⚠️  Extraction failures:");
        for failure in &report.extraction_failures {
            println!("   - {}", failure);
        }
    }
    if let Some(load) = &report.load {
        if !load.failed_batches.is_empty() {
            println!("\n⚠️  Failed batches (re-run these):");
            for batch in &load.failed_batches {
                println!(
                    "   - batch {} ({} rows, {} attempts): {}",
                    batch.batch_index + 1,
                    batch.rows_attempted,
                    batch.attempts,
                    batch.terminal_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    if let Some(validation) = &report.validation {
        println!("\n🔎 Validation:");
        for (name, check) in &validation.checks {
            println!("   [{}] {}: {}", check.status, name, check.detail);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_logging(&config.logging.dir);
    if let Some(addr) = &config.metrics_addr {
        airq_etl::metrics::init_metrics(addr);
    }
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Run => {
            println!("🔄 Running air-quality pipeline...");
            let orchestrator = build_orchestrator(&config)?;
            let report = orchestrator.run(&cancel).await;
            print_summary(&report);
            if let Some(path) = &cli.report {
                write_json(path, &report)?;
                info!(path = %path.display(), "run report written");
            }
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Extract => {
            println!("🔄 Extracting raw snapshots...");
            let orchestrator = build_orchestrator(&config)?;
            match orchestrator.extract_only(&cancel).await {
                Ok(extraction) => {
                    println!("\n📦 Stored {} snapshots", extraction.snapshots.len());
                    for snapshot in extraction.snapshots.values() {
                        println!("   - {} ({})", snapshot.store_key(), snapshot.source);
                    }
                    for failure in &extraction.failures {
                        println!("   ⚠️  {}", failure);
                    }
                }
                Err(e) => {
                    error!("Extraction failed: {}", e);
                    println!("\n❌ Extraction failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Transform { output } => {
            println!("🔄 Transforming stored snapshots...");
            let store = FsSnapshotStore::new(config.snapshots.dir.clone());
            let store: &dyn SnapshotStore = &store;
            let snapshots = load_snapshots(store, constants::RAW_PREFIX).await?;
            let dataset = Transformer::new(&config.features).transform(&snapshots);
            println!("\n📊 Transform results:");
            println!("   Snapshots read: {}", snapshots.len());
            println!("   Flattened rows: {}", dataset.stats.flattened_rows);
            println!("   Dropped empty rows: {}", dataset.stats.dropped_empty_rows);
            println!("   Skipped snapshots: {}", dataset.stats.skipped_snapshots.len());
            println!("   Staged rows: {}", dataset.len());
            if dataset.is_empty() {
                println!("\n❌ No staged rows produced");
                std::process::exit(1);
            }
            write_json(&output, &dataset)?;
            println!("   Output file: {}", output.display());
        }
    }

    Ok(())
}
