//! Columnar persistence.
//!
//! `parquet` encodes typed tables and reads files back; `snapshot` keeps the
//! immutable per-archive outputs the merge stage consumes.

pub mod parquet;
pub mod snapshot;

pub use snapshot::{SnapshotStore, StoreOutcome};
