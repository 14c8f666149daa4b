//! Per-archive snapshot store.
//!
//! Layout: `{root}/{archive}/{table}.parquet`. An archive directory only
//! appears through a rename of a fully written staging directory under
//! `{root}/.staging`, so its existence means the archive is complete.

use arrow::array::RecordBatch;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::parquet::{PARQUET_EXTENSION, read_file, to_record_batch, write_batch};
use crate::archive::ArchiveId;
use crate::config::ParquetCompression;
use crate::error::{
    ColumnarIoSnafu, CommitSnapshotSnafu, ListSnapshotsSnafu, ReadTableSnafu, SnapshotError,
    StagingDirSnafu, WriteTableSnafu,
};
use crate::normalize::TypedTable;

const STAGING_DIR: &str = ".staging";

/// What `store` did with an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { tables: usize, rows: usize },
    /// Another writer committed the archive first; nothing changed.
    AlreadyStored,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    compression: ParquetCompression,
}

impl SnapshotStore {
    /// Open the store, creating the root and discarding stale staging data.
    pub fn open(root: impl Into<PathBuf>, compression: ParquetCompression) -> Result<Self, SnapshotError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);

        if staging.exists() {
            warn!(path = %staging.display(), "Removing stale staging directory");
            std::fs::remove_dir_all(&staging).context(StagingDirSnafu {
                path: staging.display().to_string(),
            })?;
        }
        std::fs::create_dir_all(&staging).context(StagingDirSnafu {
            path: staging.display().to_string(),
        })?;

        Ok(Self { root, compression })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn archive_dir(&self, archive: &ArchiveId) -> PathBuf {
        self.root.join(archive.name())
    }

    fn table_path(dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{table}.{PARQUET_EXTENSION}"))
    }

    /// True once the archive has been committed.
    pub fn has(&self, archive: &ArchiveId) -> bool {
        self.archive_dir(archive).is_dir()
    }

    /// Write every non-empty table of an archive and commit it at once.
    ///
    /// An archive without rows still gets its (empty) directory, so it is
    /// not fetched again.
    pub fn store(
        &self,
        archive: &ArchiveId,
        tables: &[TypedTable],
    ) -> Result<StoreOutcome, SnapshotError> {
        let staging = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}-{}", archive.name(), Uuid::now_v7()));
        std::fs::create_dir_all(&staging).context(StagingDirSnafu {
            path: staging.display().to_string(),
        })?;

        let result = self.stage_and_commit(archive, tables, &staging);
        if result.is_err() || matches!(result, Ok(StoreOutcome::AlreadyStored)) {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                debug!(path = %staging.display(), "Failed to clean staging directory: {}", e);
            }
        }
        result
    }

    fn stage_and_commit(
        &self,
        archive: &ArchiveId,
        tables: &[TypedTable],
        staging: &Path,
    ) -> Result<StoreOutcome, SnapshotError> {
        let mut written = 0;
        let mut rows = 0;
        for table in tables.iter().filter(|t| t.num_rows > 0) {
            let context = || WriteTableSnafu {
                archive: archive.name(),
                table: table.name.as_str(),
            };
            let batch = to_record_batch(table).with_context(|_| context())?;
            write_batch(
                &Self::table_path(staging, &table.name),
                &batch,
                self.compression,
                Vec::new(),
            )
            .with_context(|_| context())?;
            written += 1;
            rows += table.num_rows;
        }

        let target = self.archive_dir(archive);
        if target.exists() {
            return Ok(StoreOutcome::AlreadyStored);
        }
        if let Err(source) = std::fs::rename(staging, &target) {
            // Lost a race with a concurrent writer of the same archive.
            if target.is_dir() {
                return Ok(StoreOutcome::AlreadyStored);
            }
            return Err(source).context(CommitSnapshotSnafu {
                archive: archive.name(),
            });
        }

        Ok(StoreOutcome::Stored {
            tables: written,
            rows,
        })
    }

    /// Names of committed archive directories, unordered.
    pub fn stored_archives(&self) -> Result<Vec<String>, SnapshotError> {
        list_entries(&self.root, |entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            (is_dir && !name.starts_with('.')).then_some(name)
        })
    }

    /// Table names stored for one archive, sorted.
    pub fn list_tables(&self, archive: &ArchiveId) -> Result<Vec<String>, SnapshotError> {
        let suffix = format!(".{PARQUET_EXTENSION}");
        let mut tables = list_entries(&self.archive_dir(archive), |entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix(&suffix).map(str::to_string)
        })?;
        tables.sort();
        Ok(tables)
    }

    /// Read one table of an archive, `None` when the archive has no such table.
    pub fn read(&self, archive: &ArchiveId, table: &str) -> Result<Option<RecordBatch>, SnapshotError> {
        let path = Self::table_path(&self.archive_dir(archive), table);
        let context = || ReadTableSnafu {
            archive: archive.name(),
            table,
        };
        // An unreadable directory is an error, not a missing table.
        let exists = path
            .try_exists()
            .context(ColumnarIoSnafu {
                path: path.display().to_string(),
            })
            .with_context(|_| context())?;
        if !exists {
            return Ok(None);
        }
        let contents = read_file(&path).with_context(|_| context())?;
        Ok(Some(contents.batch))
    }
}

fn list_entries(
    dir: &Path,
    mut select: impl FnMut(&std::fs::DirEntry) -> Option<String>,
) -> Result<Vec<String>, SnapshotError> {
    let context = || ListSnapshotsSnafu {
        path: dir.display().to_string(),
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|_| context())? {
        let entry = entry.with_context(|_| context())?;
        if let Some(name) = select(&entry) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveNaming;
    use crate::normalize::{ColumnData, TypedColumn};
    use tempfile::TempDir;

    fn table(name: &str, ids: &[&str]) -> TypedTable {
        TypedTable {
            name: name.to_string(),
            columns: vec![TypedColumn {
                name: "id".to_string(),
                data: ColumnData::Text(ids.iter().map(|s| Some(s.to_string())).collect()),
            }],
            num_rows: ids.len(),
        }
    }

    fn open(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::open(dir.path(), ParquetCompression::Snappy).unwrap()
    }

    #[test]
    fn test_store_commits_tables() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let archive = ArchiveNaming::default().historical(1);

        assert!(!store.has(&archive));
        let outcome = store
            .store(
                &archive,
                &[table("records", &["A1", "A2"]), table("records.events", &[])],
            )
            .unwrap();

        assert_eq!(outcome, StoreOutcome::Stored { tables: 1, rows: 2 });
        assert!(store.has(&archive));
        assert_eq!(store.list_tables(&archive).unwrap(), vec!["records"]);
        assert_eq!(store.read(&archive, "records").unwrap().unwrap().num_rows(), 2);
        assert!(store.read(&archive, "records.events").unwrap().is_none());
        assert_eq!(
            store.stored_archives().unwrap(),
            vec!["apc18840407-20191231-01"]
        );
    }

    #[test]
    fn test_second_store_leaves_first_untouched() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let archive = ArchiveNaming::default().historical(1);

        store.store(&archive, &[table("records", &["A1"])]).unwrap();
        let outcome = store
            .store(&archive, &[table("records", &["B1", "B2", "B3"])])
            .unwrap();

        assert_eq!(outcome, StoreOutcome::AlreadyStored);
        assert_eq!(store.read(&archive, "records").unwrap().unwrap().num_rows(), 1);
        let staged = std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[test]
    fn test_empty_archive_is_marked_done() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let archive = ArchiveNaming::default().historical(5);

        store.store(&archive, &[]).unwrap();
        assert!(store.has(&archive));
        assert!(store.list_tables(&archive).unwrap().is_empty());
    }

    #[test]
    fn test_open_discards_partial_staging() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join(STAGING_DIR).join("apc200101-crashed");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("records.parquet"), b"partial").unwrap();

        let store = open(&dir);

        assert!(!partial.exists());
        assert!(store.stored_archives().unwrap().is_empty());
        let naming = ArchiveNaming::default();
        assert!(!store.has(&naming.parse("apc200101").unwrap()));
    }
}
