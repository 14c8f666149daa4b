//! Configuration parsing and validation.
//!
//! Handles loading configuration from YAML files with environment variable
//! interpolation, and supplies defaults matching the trademark daily feed.

mod vars;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveNaming, DEFAULT_DAILY_START};
use crate::error::{
    ConfigError, EmptyKeyColumnsSnafu, EmptyRootPathSnafu, EmptySourceUrlSnafu,
    EnvInterpolationSnafu, ReadFileSnafu, UnknownEventKeySnafu, YamlParseSnafu,
    ZeroConcurrencySnafu,
};

pub use vars::{InterpolationResult, interpolate};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub archives: ArchivesConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Error handling configuration (optional).
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Where archive documents are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base location of the archives.
    /// Examples: "https://example.org/feed/", "s3://bucket/feed", "/mnt/feed"
    pub url: String,

    /// Suffix appended to an archive identifier to form its object name.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Container or compression format of archive payloads.
    #[serde(default)]
    pub compression: CompressionFormat,

    /// Document format inside the payload.
    #[serde(default)]
    pub format: DocumentFormat,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Maximum number of archives fetched and normalized concurrently (default: 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_archives: usize,
}

fn default_extension() -> String {
    ".zip".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

/// Naming of historical batches and daily archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivesConfig {
    #[serde(default = "default_historical_label")]
    pub historical_label: String,
    #[serde(default = "default_historical_batches")]
    pub historical_batches: u32,
    #[serde(default = "default_daily_prefix")]
    pub daily_prefix: String,
    #[serde(default = "default_daily_start")]
    pub daily_start: NaiveDate,
}

impl Default for ArchivesConfig {
    fn default() -> Self {
        Self {
            historical_label: default_historical_label(),
            historical_batches: default_historical_batches(),
            daily_prefix: default_daily_prefix(),
            daily_start: default_daily_start(),
        }
    }
}

fn default_historical_label() -> String {
    "apc18840407-20191231".to_string()
}

fn default_historical_batches() -> u32 {
    65
}

fn default_daily_prefix() -> String {
    "apc".to_string()
}

fn default_daily_start() -> NaiveDate {
    DEFAULT_DAILY_START
}

impl ArchivesConfig {
    /// Build the archive naming scheme described by this section.
    pub fn naming(&self) -> ArchiveNaming {
        ArchiveNaming {
            historical_label: self.historical_label.clone(),
            historical_batches: self.historical_batches,
            daily_prefix: self.daily_prefix.clone(),
            daily_start: self.daily_start,
        }
    }
}

/// Shape of the documents: where records live and which fields are keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Field names leading to the repeated top-level records.
    #[serde(default = "default_root_path")]
    pub root_path: Vec<String>,
    /// Fields propagated into every descendant table.
    #[serde(default = "default_key_columns")]
    pub key_columns: Vec<String>,
    /// Key column that is only unique within one archive.
    /// Dropped when folding into combined datasets (default: first key column).
    #[serde(default)]
    pub event_key: Option<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            key_columns: default_key_columns(),
            event_key: None,
        }
    }
}

fn default_root_path() -> Vec<String> {
    [
        "trademark-applications-daily",
        "application-information",
        "file-segments",
        "action-keys",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_key_columns() -> Vec<String> {
    vec![
        "action-key".to_string(),
        "case-file.serial-number".to_string(),
    ]
}

impl SchemaConfig {
    /// The per-event key column dropped during merge.
    pub fn event_key(&self) -> Option<&str> {
        self.event_key
            .as_deref()
            .or_else(|| self.key_columns.first().map(String::as_str))
    }
}

/// Local output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per stored archive.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Directory holding one combined file per table name.
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    /// Parquet compression codec.
    #[serde(default)]
    pub compression: ParquetCompression,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            dataset_path: default_dataset_path(),
            compression: ParquetCompression::default(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./downloads/us")
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("./data/us")
}

/// Merge stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Maximum number of distinct tables merged concurrently (default: 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tables: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tables: default_max_concurrent(),
        }
    }
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Error handling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Directory to write failed archive records to.
    #[serde(default)]
    pub dlq_path: Option<PathBuf>,
}

/// Compression format of fetched archives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    None,
    Gzip,
    Zstd,
    /// A zip container holding the document file.
    #[default]
    Zip,
}

/// Document format of decompressed payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    #[default]
    Xml,
    Json,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = interpolate(content);
            if !result.is_ok() {
                return EnvInterpolationSnafu {
                    message: result.errors.join("\n"),
                }
                .fail();
            }
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.url.is_empty(), EmptySourceUrlSnafu);
        ensure!(!self.schema.root_path.is_empty(), EmptyRootPathSnafu);
        ensure!(!self.schema.key_columns.is_empty(), EmptyKeyColumnsSnafu);
        if let Some(event_key) = &self.schema.event_key {
            ensure!(
                self.schema.key_columns.contains(event_key),
                UnknownEventKeySnafu { event_key }
            );
        }
        ensure!(
            self.source.max_concurrent_archives > 0,
            ZeroConcurrencySnafu {
                field: "source.max_concurrent_archives"
            }
        );
        ensure!(
            self.merge.max_concurrent_tables > 0,
            ZeroConcurrencySnafu {
                field: "merge.max_concurrent_tables"
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_feed_defaults() {
        let yaml = r#"
source:
  url: "https://example.org/feed/"
"#;
        let config = Config::from_yaml(yaml, false).unwrap();

        assert_eq!(config.source.extension, ".zip");
        assert_eq!(config.source.compression, CompressionFormat::Zip);
        assert_eq!(config.source.format, DocumentFormat::Xml);
        assert_eq!(config.source.max_concurrent_archives, 4);
        assert_eq!(config.archives.historical_batches, 65);
        assert_eq!(config.archives.historical_label, "apc18840407-20191231");
        assert_eq!(
            config.archives.daily_start,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );
        assert_eq!(config.schema.root_path.len(), 4);
        assert_eq!(config.schema.event_key(), Some("action-key"));
        assert_eq!(config.storage.compression, ParquetCompression::Snappy);
        assert!(!config.metrics.enabled);
        assert!(config.error_handling.dlq_path.is_none());
    }

    #[test]
    fn test_full_config_parsing() {
        let yaml = r#"
source:
  url: "/mnt/feed"
  extension: ".json"
  compression: none
  format: json
  max_concurrent_archives: 8

archives:
  historical_label: "hist"
  historical_batches: 3
  daily_prefix: "day"
  daily_start: 2024-02-01

schema:
  root_path: ["records"]
  key_columns: ["id", "case"]
  event_key: "id"

storage:
  snapshot_path: "/tmp/snapshots"
  dataset_path: "/tmp/datasets"
  compression: zstd

merge:
  max_concurrent_tables: 2

error_handling:
  dlq_path: "/tmp/dlq"
"#;
        let config = Config::from_yaml(yaml, false).unwrap();

        assert_eq!(config.source.compression, CompressionFormat::None);
        assert_eq!(config.source.format, DocumentFormat::Json);
        assert_eq!(config.source.max_concurrent_archives, 8);
        assert_eq!(config.archives.historical_batches, 3);
        assert_eq!(config.schema.root_path, vec!["records"]);
        assert_eq!(config.schema.event_key(), Some("id"));
        assert_eq!(config.storage.compression, ParquetCompression::Zstd);
        assert_eq!(config.merge.max_concurrent_tables, 2);
        assert_eq!(
            config.error_handling.dlq_path,
            Some(PathBuf::from("/tmp/dlq"))
        );
    }

    #[test]
    fn test_event_key_must_be_a_key_column() {
        let yaml = r#"
source:
  url: "/mnt/feed"
schema:
  root_path: ["records"]
  key_columns: ["id", "case"]
  event_key: "status"
"#;
        let err = Config::from_yaml(yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEventKey { .. }));
    }

    #[test]
    fn test_empty_root_path_rejected() {
        let yaml = r#"
source:
  url: "/mnt/feed"
schema:
  root_path: []
  key_columns: ["id"]
"#;
        let err = Config::from_yaml(yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRootPath));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let yaml = r#"
source:
  url: "/mnt/feed"
  max_concurrent_archives: 0
"#;
        let err = Config::from_yaml(yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency { .. }));
    }

    #[test]
    fn test_empty_source_url_rejected() {
        let yaml = r#"
source:
  url: ""
"#;
        let err = Config::from_yaml(yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySourceUrl));
    }
}
