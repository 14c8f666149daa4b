//! tessera: fetch daily feed archives, store per-archive Parquet snapshots
//! and fold them into cumulative per-table datasets.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tessera::config::Config;
use tessera::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use tessera::metrics;
use tessera::pipeline::{self, RunOptions, run_pipeline};

/// Nested feed archives to flat Parquet datasets.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and enumerate archives without processing.
    #[arg(long)]
    dry_run: bool,

    /// Only merge snapshots that are already stored.
    #[arg(long, conflicts_with = "skip_merge")]
    skip_download: bool,

    /// Only download and store snapshots.
    #[arg(long)]
    skip_merge: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("tessera starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        let today = chrono::Local::now().date_naive();
        let archives = config.archives.naming().all_identifiers(today);
        info!("Dry run mode - validating configuration");
        info!("Source: {}", config.source.url);
        info!("Snapshots: {}", config.storage.snapshot_path.display());
        info!("Datasets: {}", config.storage.dataset_path.display());
        info!("Root path: {}", config.schema.root_path.join("."));
        info!("Key columns: {}", config.schema.key_columns.join(", "));
        info!("Archives up to {}: {}", today, archives.len());
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    pipeline::cancel_on_signal(shutdown.clone());

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr, shutdown.clone())
            .await
            .context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let options = RunOptions {
        skip_download: args.skip_download,
        skip_merge: args.skip_merge,
    };
    let report = run_pipeline(config, options, shutdown.clone()).await?;

    if let Some(download) = &report.download {
        info!("Download stage:");
        info!("  Archives stored: {}", download.stored());
        info!("  Already stored: {}", download.already_stored());
        info!("  Rows stored: {}", download.rows());
        let failures = download.failures();
        info!(
            "  Archives skipped: {} (fetch: {}, schema: {}, store: {})",
            failures.total(),
            failures.fetch,
            failures.schema,
            failures.store
        );
        for (archive, reason) in download.skipped() {
            warn!("  Skipped {} ({}): {}", archive, reason.stage().as_str(), reason);
        }
        if download.cancelled {
            warn!("  Interrupted before all archives were launched");
        }
    }

    if let Some(merge) = &report.merge {
        info!("Merge stage:");
        for table in &merge.merged {
            info!(
                "  {}: {} archives appended, {} rows, {} already merged",
                table.table,
                table.merged.len(),
                table.rows,
                table.already_merged
            );
        }
        for (archive, e) in &merge.unreadable {
            warn!("  Could not list tables of {}: {}", archive, e);
        }
        for (table, e) in &merge.failed {
            warn!("  {} failed: {}", table, e);
        }
        if merge.cancelled {
            warn!("  Interrupted before all tables were launched");
        }
    }

    shutdown.cancel();
    info!("Pipeline completed");
    Ok(())
}
