//! Dead letter queue for skipped archives.
//!
//! Records every archive the download stage skipped, with the stage and
//! error, as NDJSON under the configured directory. Each run writes its own
//! `failures-{timestamp}.ndjson` file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqCreateDirSnafu, DlqError, DlqSerializeSnafu, DlqWriteSnafu};
use crate::metrics::events::FailureStage;

/// One skipped archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedArchive {
    pub archive: String,
    pub stage: FailureStage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Failure counts by stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub fetch: usize,
    pub schema: usize,
    pub store: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Fetch => self.fetch += 1,
            FailureStage::Schema => self.schema += 1,
            FailureStage::Store => self.store += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetch + self.schema + self.store
    }
}

/// Buffers failures in memory until [`flush`](Self::flush).
#[derive(Debug)]
pub struct DeadLetterQueue {
    path: PathBuf,
    buffer: Mutex<Vec<FailedArchive>>,
    stats: Mutex<FailureStats>,
}

impl DeadLetterQueue {
    /// Returns `None` if no DLQ path is configured.
    pub fn from_config(config: &ErrorHandlingConfig) -> Option<Self> {
        let dir = config.dlq_path.as_ref()?;
        let filename = format!("failures-{}.ndjson", Utc::now().format("%Y%m%d-%H%M%S"));
        let path = dir.join(filename);
        info!("DLQ enabled: {}", path.display());
        Some(Self::new(path))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
        }
    }

    /// File the records are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_failure(&self, archive: &str, error: &str, stage: FailureStage) {
        debug!(archive, stage = stage.as_str(), "Recording DLQ failure");
        self.stats.lock().await.increment(stage);
        self.buffer.lock().await.push(FailedArchive {
            archive: archive.to_string(),
            stage,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub async fn stats(&self) -> FailureStats {
        *self.stats.lock().await
    }

    /// Append buffered records to the DLQ file.
    pub async fn flush(&self) -> Result<(), DlqError> {
        let records = std::mem::take(&mut *self.buffer.lock().await);
        if records.is_empty() {
            return Ok(());
        }

        let mut content = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut content, record).context(DlqSerializeSnafu)?;
            content.push(b'\n');
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(DlqCreateDirSnafu {
                    path: parent.display().to_string(),
                })?;
        }

        let path = self.path.display().to_string();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(DlqWriteSnafu { path: &path })?;
        file.write_all(&content)
            .await
            .context(DlqWriteSnafu { path: &path })?;
        file.flush().await.context(DlqWriteSnafu { path: &path })?;

        info!("Wrote {} failure records to {}", records.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_failure_stats_increment() {
        let mut stats = FailureStats::default();
        stats.increment(FailureStage::Fetch);
        stats.increment(FailureStage::Fetch);
        stats.increment(FailureStage::Schema);

        assert_eq!(stats.fetch, 2);
        assert_eq!(stats.schema, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_record_serialization() {
        let json = r#"{"archive":"apc200101","stage":"schema","error":"Root path segment 'records' not found (at '')","timestamp":"2025-01-26T10:30:00Z"}"#;
        let record: FailedArchive = serde_json::from_str(json).unwrap();

        assert_eq!(record.archive, "apc200101");
        assert_eq!(record.stage, FailureStage::Schema);
        assert!(serde_json::to_string(&record).unwrap().contains("\"stage\":\"schema\""));
    }

    #[test]
    fn test_disabled_without_path() {
        assert!(DeadLetterQueue::from_config(&ErrorHandlingConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_flush_appends_ndjson() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq").join("failures.ndjson"));

        dlq.record_failure("apc200101", "not found", FailureStage::Fetch)
            .await;
        dlq.flush().await.unwrap();
        dlq.record_failure("apc200102", "bad root", FailureStage::Schema)
            .await;
        dlq.flush().await.unwrap();
        dlq.flush().await.unwrap();

        let content = std::fs::read_to_string(dlq.path()).unwrap();
        let records: Vec<FailedArchive> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].archive, "apc200101");
        assert_eq!(records[1].stage, FailureStage::Schema);
        assert_eq!(dlq.stats().await.total(), 2);
    }
}
