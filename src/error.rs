//! Error types for tessera using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. Selector names share one namespace,
//! so variant names are unique across enums.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// HTTP store configuration error.
    #[snafu(display("HTTP configuration error: {source}"))]
    HttpConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Source URL is empty.
    #[snafu(display("Source url cannot be empty"))]
    EmptySourceUrl,

    /// Root path has no segments.
    #[snafu(display("Schema root_path must have at least one segment"))]
    EmptyRootPath,

    /// No key columns configured.
    #[snafu(display("Schema must declare at least one key column"))]
    EmptyKeyColumns,

    /// The event key is not one of the key columns.
    #[snafu(display("Event key '{event_key}' is not one of the key columns"))]
    UnknownEventKey { event_key: String },

    /// A concurrency limit was set to zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroConcurrency { field: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Fetch Errors ============

/// Errors raised while retrieving one archive document.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// The archive does not exist at the source.
    #[snafu(display("Archive {archive} not found at source"))]
    NotFound { archive: String },

    /// Transport-level failure.
    #[snafu(display("Failed to fetch archive {archive}: {source}"))]
    Transport {
        archive: String,
        source: StorageError,
    },

    /// Payload could not be decompressed.
    #[snafu(display("Failed to decompress archive {archive}: {source}"))]
    Decompress {
        archive: String,
        source: std::io::Error,
    },

    /// Payload is not a valid document.
    #[snafu(display("Failed to decode archive {archive}: {source}"))]
    Decode {
        archive: String,
        source: DocumentError,
    },
}

/// Errors raised while decoding a payload into a document tree.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DocumentError {
    #[snafu(display("Invalid JSON: {source}"))]
    JsonSyntax { source: serde_json::Error },

    #[snafu(display("Invalid XML: {source}"))]
    XmlSyntax { source: quick_xml::Error },

    /// The payload ended inside an element.
    #[snafu(display("XML element <{element}> is never closed"))]
    XmlUnclosed { element: String },

    #[snafu(display("XML payload has no root element"))]
    XmlEmpty,
}

// ============ Schema Errors ============

/// Errors raised when a document does not have the expected structure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Normalization was asked to run with an empty root path.
    #[snafu(display("Root path is empty"))]
    RootPathEmpty,

    /// A root path segment is absent from the document.
    #[snafu(display("Root path segment '{segment}' not found (at '{path}')"))]
    RootSegmentMissing { segment: String, path: String },

    /// The root path resolves to something other than records.
    #[snafu(display("Root path '{path}' does not resolve to records"))]
    RootNotRecords { path: String },
}

// ============ Columnar Errors ============

/// Errors that can occur while encoding or decoding Parquet files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ColumnarError {
    /// Failed to build an Arrow record batch.
    #[snafu(display("Failed to build record batch: {source}"))]
    ArrowEncode {
        source: arrow::error::ArrowError,
    },

    /// Failed to write Parquet.
    #[snafu(display("Failed to write Parquet: {source}"))]
    ParquetWrite {
        source: parquet::errors::ParquetError,
    },

    /// Failed to read Parquet.
    #[snafu(display("Failed to read Parquet: {source}"))]
    ParquetRead {
        source: parquet::errors::ParquetError,
    },

    /// Failed to decode a record batch from Parquet.
    #[snafu(display("Failed to decode record batch: {source}"))]
    ArrowDecode {
        source: arrow::error::ArrowError,
    },

    /// File system error on a columnar file.
    #[snafu(display("IO error on {path}: {source}"))]
    ColumnarIo {
        path: String,
        source: std::io::Error,
    },
}

// ============ Snapshot Errors ============

/// Errors that can occur in the snapshot store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SnapshotError {
    /// Failed to prepare a staging directory.
    #[snafu(display("Failed to prepare staging directory {path}: {source}"))]
    StagingDir {
        path: String,
        source: std::io::Error,
    },

    /// Failed to move a staged archive into place.
    #[snafu(display("Failed to commit snapshot {archive}: {source}"))]
    CommitSnapshot {
        archive: String,
        source: std::io::Error,
    },

    /// Failed to write one table of an archive.
    #[snafu(display("Failed to write table {table} of {archive}: {source}"))]
    WriteTable {
        archive: String,
        table: String,
        source: ColumnarError,
    },

    /// Failed to read one table of an archive.
    #[snafu(display("Failed to read table {table} of {archive}: {source}"))]
    ReadTable {
        archive: String,
        table: String,
        source: ColumnarError,
    },

    /// Failed to list snapshot directories or files.
    #[snafu(display("Failed to list {path}: {source}"))]
    ListSnapshots {
        path: String,
        source: std::io::Error,
    },
}

// ============ Manifest Errors ============

/// Errors that can occur while loading or persisting the merge manifest.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ManifestError {
    /// Failed to read the manifest file.
    #[snafu(display("Failed to read manifest {path}: {source}"))]
    ManifestRead {
        path: String,
        source: std::io::Error,
    },

    /// The manifest file is not valid JSON.
    #[snafu(display("Failed to parse manifest {path}: {source}"))]
    ManifestParse {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to serialize the manifest.
    #[snafu(display("Failed to serialize manifest: {source}"))]
    ManifestSerialize { source: serde_json::Error },

    /// Failed to write the manifest file.
    #[snafu(display("Failed to write manifest {path}: {source}"))]
    ManifestWrite {
        path: String,
        source: std::io::Error,
    },

    /// Manifest lock poisoned by a panicked merge.
    #[snafu(display("Manifest lock poisoned"))]
    ManifestLock,
}

// ============ Merge Errors ============

/// Errors that abort the merge of one table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MergeError {
    /// A snapshot table could not be read.
    #[snafu(display("Failed to read snapshot table {table} of {archive}: {source}"))]
    SnapshotRead {
        archive: String,
        table: String,
        source: SnapshotError,
    },

    /// The combined dataset could not be read.
    #[snafu(display("Failed to read combined dataset {table}: {source}"))]
    DatasetRead {
        table: String,
        source: ColumnarError,
    },

    /// The combined dataset could not be written.
    #[snafu(display("Failed to write combined dataset {table}: {source}"))]
    DatasetWrite {
        table: String,
        source: ColumnarError,
    },

    /// A column changed type between archives.
    #[snafu(display(
        "Column {column} of {table} has type {existing} in the dataset but {incoming} in the archive"
    ))]
    SchemaConflict {
        table: String,
        column: String,
        existing: String,
        incoming: String,
    },

    /// Concatenating batches failed.
    #[snafu(display("Failed to concatenate batches for {table}: {source}"))]
    Concat {
        table: String,
        source: arrow::error::ArrowError,
    },

    /// Manifest operation failed.
    #[snafu(display("Manifest error: {source}"))]
    MergeManifest { source: ManifestError },

    /// The per-table lock was poisoned.
    #[snafu(display("Lock for table {table} poisoned"))]
    TableLock { table: String },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to bind the metrics listener.
    #[snafu(display("Failed to bind metrics server to {addr}: {source}"))]
    MetricsBind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur while recording failed archives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to create the DLQ directory.
    #[snafu(display("Failed to create DLQ directory {path}: {source}"))]
    DlqCreateDir {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize a failure record.
    #[snafu(display("Failed to serialize DLQ record: {source}"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to write failure records.
    #[snafu(display("Failed to write DLQ file {path}: {source}"))]
    DlqWrite {
        path: String,
        source: std::io::Error,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    PipelineStorage { source: StorageError },

    /// Snapshot store error.
    #[snafu(display("Snapshot store error: {source}"))]
    PipelineSnapshot { source: SnapshotError },

    /// Manifest error.
    #[snafu(display("Manifest error: {source}"))]
    PipelineManifest { source: ManifestError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<SnapshotError> for PipelineError {
    fn from(source: SnapshotError) -> Self {
        PipelineError::PipelineSnapshot { source }
    }
}

impl From<DlqError> for PipelineError {
    fn from(source: DlqError) -> Self {
        PipelineError::Dlq { source }
    }
}
