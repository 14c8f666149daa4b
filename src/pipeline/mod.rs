//! Pipeline orchestration.
//!
//! Two stages:
//! - **Download**: for every enumerated archive not yet stored, fetch the
//!   document (I/O, on tokio tasks), then normalize, coerce dates and store
//!   the snapshot (CPU, on the blocking pool). Archives are independent and
//!   run with bounded concurrency; a failure skips only that archive.
//! - **Merge**: fold every stored snapshot into the combined dataset of each
//!   table name, distinct tables in parallel, one writer per table.
//!
//! Shutdown stops launching new work; in-flight archives finish and commit
//! atomically, and the merge stage is not started.

mod report;
mod signal;

pub use report::{ArchiveOutcome, DownloadReport, MergeReport, RunReport, SkipReason};
pub use signal::shutdown_signal;

use chrono::NaiveDate;
use futures::stream::{FuturesUnordered, StreamExt};
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveId;
use crate::config::Config;
use crate::dlq::DeadLetterQueue;
use crate::emit;
use crate::error::{
    DlqSnafu, PipelineError, PipelineManifestSnafu, PipelineStorageSnafu, TaskJoinSnafu,
};
use crate::merge::MergeEngine;
use crate::metrics::events::{
    ArchiveFailed, ArchiveProcessed, ArchiveStatus, SnapshotStored, TableMergeCompleted,
};
use crate::normalize::{Normalizer, TypedTable, coerce_dates};
use crate::sink::{SnapshotStore, StoreOutcome};
use crate::source::{ArchiveFetcher, RawDocument, StorageFetcher};
use crate::storage::StorageProvider;

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_download: bool,
    pub skip_merge: bool,
}

/// Main processing pipeline.
pub struct Pipeline {
    config: Config,
    fetcher: Arc<dyn ArchiveFetcher>,
    normalizer: Arc<Normalizer>,
    snapshots: SnapshotStore,
    merge: Arc<MergeEngine>,
    dlq: Option<DeadLetterQueue>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline fetching from the configured source.
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self, PipelineError> {
        let storage = StorageProvider::for_url_with_options(
            &config.source.url,
            config.source.storage_options.clone(),
        )
        .await
        .context(PipelineStorageSnafu)?;
        info!("Fetching archives from {}", storage.canonical_url());

        let fetcher = Arc::new(StorageFetcher::new(Arc::new(storage), &config.source));
        Self::with_fetcher(config, fetcher, shutdown)
    }

    /// Create a pipeline around any fetcher.
    pub fn with_fetcher(
        config: Config,
        fetcher: Arc<dyn ArchiveFetcher>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let snapshots =
            SnapshotStore::open(&config.storage.snapshot_path, config.storage.compression)?;
        let merge = MergeEngine::open(
            snapshots.clone(),
            &config.storage.dataset_path,
            config.storage.compression,
            config.schema.event_key().map(str::to_string),
        )
        .context(PipelineManifestSnafu)?;
        let normalizer = Normalizer::new(
            config.schema.root_path.clone(),
            config.schema.key_columns.clone(),
        );
        let dlq = DeadLetterQueue::from_config(&config.error_handling);

        Ok(Self {
            config,
            fetcher,
            normalizer: Arc::new(normalizer),
            snapshots,
            merge: Arc::new(merge),
            dlq,
            shutdown,
        })
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Enumerate archives published before `today`, download, then merge.
    pub async fn run(&self, today: NaiveDate, options: RunOptions) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();

        if !options.skip_download {
            let archives = self.config.archives.naming().all_identifiers(today);
            info!("Enumerated {} archives published before {}", archives.len(), today);
            report.download = Some(self.download(archives).await?);
        }

        if self.shutdown.is_cancelled() {
            info!("Shutdown requested, not starting merge");
            return Ok(report);
        }

        if !options.skip_merge {
            report.merge = Some(self.merge().await?);
        }
        Ok(report)
    }

    /// Fetch, normalize and store every archive not stored yet.
    pub async fn download(&self, archives: Vec<ArchiveId>) -> Result<DownloadReport, PipelineError> {
        let max_concurrent = self.config.source.max_concurrent_archives;
        let mut report = DownloadReport::default();
        let mut pending = archives.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < max_concurrent {
                if self.shutdown.is_cancelled() {
                    if pending.len() > 0 && !report.cancelled {
                        info!(
                            remaining = pending.len(),
                            "Shutdown requested, not launching further archives"
                        );
                        report.cancelled = true;
                    }
                    break;
                }
                let Some(archive) = pending.next() else {
                    break;
                };
                in_flight.push(self.process_archive(archive));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            report.outcomes.push(outcome?);
        }

        report.outcomes.sort_by(|a, b| a.archive().cmp(b.archive()));

        if let Some(dlq) = &self.dlq {
            for (archive, reason) in report.skipped() {
                dlq.record_failure(archive.name(), &reason.to_string(), reason.stage())
                    .await;
            }
            dlq.flush().await.context(DlqSnafu)?;
            let stats = dlq.stats().await;
            if stats.total() > 0 {
                info!(
                    fetch = stats.fetch,
                    schema = stats.schema,
                    store = stats.store,
                    "Recorded {} failed archives in {}",
                    stats.total(),
                    dlq.path().display()
                );
            }
        }

        info!(
            stored = report.stored(),
            already_stored = report.already_stored(),
            skipped = report.skipped().count(),
            rows = report.rows(),
            "Download stage complete"
        );
        Ok(report)
    }

    async fn process_archive(&self, archive: ArchiveId) -> Result<ArchiveOutcome, PipelineError> {
        if self.snapshots.has(&archive) {
            emit!(ArchiveProcessed {
                status: ArchiveStatus::AlreadyStored
            });
            return Ok(ArchiveOutcome::AlreadyStored { archive });
        }

        let document = match self.fetcher.fetch(&archive).await {
            Ok(document) => document,
            Err(e) => return Ok(skip(archive, SkipReason::Fetch(e))),
        };

        let normalizer = self.normalizer.clone();
        let snapshots = self.snapshots.clone();
        let id = archive.clone();
        let stored = tokio::task::spawn_blocking(move || {
            normalize_and_store(&normalizer, &snapshots, &id, document)
        })
        .await
        .context(TaskJoinSnafu)?;

        Ok(match stored {
            Ok(StoreOutcome::Stored { tables, rows }) => {
                emit!(SnapshotStored {
                    tables: tables as u64,
                    rows: rows as u64,
                });
                emit!(ArchiveProcessed {
                    status: ArchiveStatus::Stored
                });
                info!(archive = %archive, tables, rows, "Stored archive");
                ArchiveOutcome::Stored {
                    archive,
                    tables,
                    rows,
                }
            }
            Ok(StoreOutcome::AlreadyStored) => {
                emit!(ArchiveProcessed {
                    status: ArchiveStatus::AlreadyStored
                });
                ArchiveOutcome::AlreadyStored { archive }
            }
            Err(reason) => skip(archive, reason),
        })
    }

    /// Fold every stored snapshot into the combined datasets.
    pub async fn merge(&self) -> Result<MergeReport, PipelineError> {
        let naming = self.config.archives.naming();
        let mut archives: Vec<ArchiveId> = self
            .snapshots
            .stored_archives()?
            .iter()
            .filter_map(|name| {
                let parsed = naming.parse(name);
                if parsed.is_none() {
                    debug!(name, "Ignoring unrecognized snapshot directory");
                }
                parsed
            })
            .collect();
        archives.sort();

        let mut report = MergeReport::default();
        let mut tables = BTreeSet::new();
        for archive in &archives {
            match self.snapshots.list_tables(archive) {
                Ok(names) => tables.extend(names),
                // Still passed to every table merge, which fails on reading it.
                Err(e) => {
                    warn!(archive = %archive, "Cannot list snapshot tables: {}", e);
                    report.unreadable.push((archive.name().to_string(), e));
                }
            }
        }
        info!(
            archives = archives.len(),
            tables = tables.len(),
            "Starting merge stage"
        );

        let archives: Arc<[ArchiveId]> = archives.into();
        let max_concurrent = self.config.merge.max_concurrent_tables;
        let mut pending = tables.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < max_concurrent {
                if self.shutdown.is_cancelled() {
                    report.cancelled |= pending.len() > 0;
                    break;
                }
                let Some(table) = pending.next() else {
                    break;
                };
                let engine = self.merge.clone();
                let archives = archives.clone();
                in_flight.push(tokio::task::spawn_blocking(move || {
                    let start = Instant::now();
                    let result = engine.merge(&table, &archives);
                    emit!(TableMergeCompleted {
                        duration: start.elapsed(),
                        success: result.is_ok(),
                    });
                    (table, result)
                }));
            }

            let Some(joined) = in_flight.next().await else {
                break;
            };
            let (table, result) = joined.context(TaskJoinSnafu)?;
            match result {
                Ok(merged) => report.merged.push(merged),
                Err(e) => {
                    error!(table = %table, "Merge failed: {}", e);
                    report.failed.push((table, e));
                }
            }
        }

        report.merged.sort_by(|a, b| a.table.cmp(&b.table));
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            merged = report.merged.len(),
            failed = report.failed.len(),
            "Merge stage complete"
        );
        Ok(report)
    }
}

fn skip(archive: ArchiveId, reason: SkipReason) -> ArchiveOutcome {
    warn!(archive = %archive, stage = reason.stage().as_str(), "Skipping archive: {}", reason);
    emit!(ArchiveFailed {
        stage: reason.stage()
    });
    emit!(ArchiveProcessed {
        status: ArchiveStatus::Skipped
    });
    ArchiveOutcome::Skipped { archive, reason }
}

fn normalize_and_store(
    normalizer: &Normalizer,
    snapshots: &SnapshotStore,
    archive: &ArchiveId,
    document: RawDocument,
) -> Result<StoreOutcome, SkipReason> {
    let tables = normalizer
        .normalize(&document)
        .map_err(SkipReason::Schema)?;
    drop(document);

    let typed: Vec<TypedTable> = tables.into_values().map(coerce_dates).collect();
    snapshots.store(archive, &typed).map_err(SkipReason::Store)
}

/// Cancel `shutdown` when the process receives a shutdown signal.
pub fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });
}

/// Run the pipeline with the given configuration, enumerating up to today.
pub async fn run_pipeline(
    config: Config,
    options: RunOptions,
    shutdown: CancellationToken,
) -> Result<RunReport, PipelineError> {
    let today = chrono::Local::now().date_naive();
    let pipeline = Pipeline::new(config, shutdown).await?;
    pipeline.run(today, options).await
}
