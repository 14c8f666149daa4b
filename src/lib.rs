//! tessera: normalizes nested daily feed archives into flat Parquet tables.
//!
//! Each archive is fetched once, flattened into one table per repeated
//! element, and stored as an immutable snapshot. Snapshots are then folded
//! into one cumulative dataset per table name, tracked by a merge manifest
//! so repeated runs never append the same archive twice.
//!
//! # Example
//!
//! ```ignore
//! use tessera::{Config, RunOptions, run_pipeline, error::PipelineError};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("config.yaml")?;
//!     let report = run_pipeline(config, RunOptions::default(), CancellationToken::new()).await?;
//!     if let Some(download) = report.download {
//!         println!("Stored {} archives", download.stored());
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod dlq;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod storage;

// Re-export main types
pub use archive::{ArchiveId, ArchiveKind, ArchiveNaming};
pub use config::Config;
pub use merge::{MergeEngine, TableMerge};
pub use normalize::Normalizer;
pub use pipeline::{Pipeline, RunOptions, RunReport, run_pipeline};
pub use sink::SnapshotStore;
pub use source::{ArchiveFetcher, RawDocument, StorageFetcher};
pub use storage::{StorageProvider, StorageProviderRef};
