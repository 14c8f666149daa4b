//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of one archive in the download stage.
#[derive(Debug, Clone, Copy)]
pub enum ArchiveStatus {
    Stored,
    AlreadyStored,
    Skipped,
}

impl ArchiveStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Stored => "stored",
            ArchiveStatus::AlreadyStored => "already_stored",
            ArchiveStatus::Skipped => "skipped",
        }
    }
}

/// Stage at which an archive failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Schema,
    Store,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Schema => "schema",
            FailureStage::Store => "store",
        }
    }
}

/// Event emitted once per enumerated archive.
pub struct ArchiveProcessed {
    pub status: ArchiveStatus,
}

impl InternalEvent for ArchiveProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Archive processed");
        counter!("tessera_archives_processed_total", "status" => self.status.as_str())
            .increment(1);
    }
}

/// Event emitted when an archive is skipped.
pub struct ArchiveFailed {
    pub stage: FailureStage,
}

impl InternalEvent for ArchiveFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Archive failed");
        counter!("tessera_archives_failed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Event emitted when compressed bytes are read from the source.
pub struct BytesRead {
    pub bytes: u64,
}

impl InternalEvent for BytesRead {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes read");
        counter!("tessera_bytes_read_total").increment(self.bytes);
    }
}

/// Event emitted when a snapshot is committed.
pub struct SnapshotStored {
    pub tables: u64,
    pub rows: u64,
}

impl InternalEvent for SnapshotStored {
    fn emit(self) {
        trace!(tables = self.tables, rows = self.rows, "Snapshot stored");
        counter!("tessera_snapshot_tables_written_total").increment(self.tables);
        counter!("tessera_snapshot_rows_written_total").increment(self.rows);
    }
}

/// Event emitted when one archive is folded into a combined dataset.
pub struct RowsMerged {
    pub table: String,
    pub count: u64,
}

impl InternalEvent for RowsMerged {
    fn emit(self) {
        trace!(table = %self.table, count = self.count, "Rows merged");
        counter!("tessera_rows_merged_total", "table" => self.table).increment(self.count);
    }
}

// ============================================================================
// Histogram events for timing
// ============================================================================

/// Event emitted when an archive fetch completes.
pub struct ArchiveFetchCompleted {
    pub duration: Duration,
}

impl InternalEvent for ArchiveFetchCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Archive fetch completed"
        );
        histogram!("tessera_archive_fetch_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when decompression of an archive completes.
pub struct DecompressionCompleted {
    pub duration: Duration,
}

impl InternalEvent for DecompressionCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Decompression completed"
        );
        histogram!("tessera_decompression_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a Parquet file has been written.
pub struct ParquetWriteCompleted {
    pub bytes: u64,
    pub duration: Duration,
}

impl InternalEvent for ParquetWriteCompleted {
    fn emit(self) {
        trace!(
            bytes = self.bytes,
            duration_ms = self.duration.as_millis(),
            "Parquet write completed"
        );
        counter!("tessera_bytes_written_total").increment(self.bytes);
        histogram!("tessera_parquet_write_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the merge of one table finishes.
pub struct TableMergeCompleted {
    pub duration: Duration,
    pub success: bool,
}

impl InternalEvent for TableMergeCompleted {
    fn emit(self) {
        let status = if self.success { "success" } else { "failed" };
        trace!(
            status,
            duration_ms = self.duration.as_millis(),
            "Table merge completed"
        );
        histogram!("tessera_table_merge_duration_seconds", "status" => status)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage request metrics
// ============================================================================

/// Type of storage operation.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "tessera_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes (for latency tracking).
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "tessera_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
