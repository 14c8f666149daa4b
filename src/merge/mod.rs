//! Incremental merge engine.
//!
//! Folds each archive's version of a table into one combined dataset at
//! `{dataset_root}/{table}.parquet`, in archive order, dropping the event
//! key column. The manifest records what has been folded so repeated runs
//! never duplicate rows. The dataset file also carries its own list of
//! merged archives in Parquet metadata; a crash between rewriting the
//! dataset and updating the manifest is repaired from that list on the next
//! merge of the table.

pub mod manifest;

pub use manifest::{MANIFEST_FILE, ManifestStore, MergeManifest};

use arrow::array::{ArrayRef, RecordBatch, new_null_array};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema, SchemaRef};
use snafu::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::archive::ArchiveId;
use crate::config::ParquetCompression;
use crate::emit;
use crate::error::{
    ConcatSnafu, DatasetReadSnafu, DatasetWriteSnafu, ManifestError, ManifestWriteSnafu,
    MergeError, MergeManifestSnafu, SchemaConflictSnafu, SnapshotReadSnafu, TableLockSnafu,
};
use crate::metrics::events::RowsMerged;
use crate::sink::SnapshotStore;
use crate::sink::parquet::{PARQUET_EXTENSION, read_file, write_batch};

/// Parquet metadata key listing the archives contained in a dataset.
pub const MERGED_ARCHIVES_KEY: &str = "tessera.merged_archives";

/// Result of merging one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMerge {
    pub table: String,
    /// Archives folded in by this call, in order.
    pub merged: Vec<String>,
    /// Archives skipped because the manifest already lists them.
    pub already_merged: usize,
    /// Archives whose snapshot has no rows for this table.
    pub absent: usize,
    /// Archives with no committed snapshot yet; left for a later merge.
    pub not_stored: usize,
    /// Rows appended by this call.
    pub rows: usize,
    /// Archives recovered from dataset metadata into the manifest.
    pub reconciled: usize,
}

/// Folds snapshot tables into combined datasets.
#[derive(Debug)]
pub struct MergeEngine {
    snapshots: SnapshotStore,
    dataset_root: PathBuf,
    compression: ParquetCompression,
    event_key: Option<String>,
    manifest: ManifestStore,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MergeEngine {
    /// Open the dataset directory and its manifest.
    pub fn open(
        snapshots: SnapshotStore,
        dataset_root: impl Into<PathBuf>,
        compression: ParquetCompression,
        event_key: Option<String>,
    ) -> Result<Self, ManifestError> {
        let dataset_root = dataset_root.into();
        std::fs::create_dir_all(&dataset_root).context(ManifestWriteSnafu {
            path: dataset_root.display().to_string(),
        })?;
        let manifest = ManifestStore::load(&dataset_root)?;

        Ok(Self {
            snapshots,
            dataset_root,
            compression,
            event_key,
            manifest,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Location of the combined dataset for `table`.
    pub fn dataset_path(&self, table: &str) -> PathBuf {
        self.dataset_root
            .join(format!("{table}.{PARQUET_EXTENSION}"))
    }

    fn table_lock(&self, table: &str) -> Result<Arc<Mutex<()>>, MergeError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| TableLockSnafu { table }.build())?;
        Ok(locks.entry(table.to_string()).or_default().clone())
    }

    /// Fold `archives` into the combined dataset of `table`.
    ///
    /// Archives are processed in archive order regardless of the order
    /// given. Archives already in the manifest are skipped, so calling this
    /// twice with the same archives changes nothing the second time. The
    /// dataset and manifest are both updated after every archive.
    pub fn merge(&self, table: &str, archives: &[ArchiveId]) -> Result<TableMerge, MergeError> {
        let lock = self.table_lock(table)?;
        let _guard = lock.lock().map_err(|_| TableLockSnafu { table }.build())?;

        let mut ordered = archives.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut result = TableMerge {
            table: table.to_string(),
            ..Default::default()
        };

        let path = self.dataset_path(table);
        let (mut dataset, mut contained) = self.load_dataset(table, &path)?;

        let mut merged = self.manifest.merged(table).context(MergeManifestSnafu)?;
        let unrecorded: Vec<String> = contained.difference(&merged).cloned().collect();
        if !unrecorded.is_empty() {
            warn!(
                table,
                count = unrecorded.len(),
                "Dataset contains archives missing from the manifest, recording them"
            );
            self.manifest
                .record(table, unrecorded.iter().cloned())
                .context(MergeManifestSnafu)?;
            result.reconciled = unrecorded.len();
            merged.extend(unrecorded);
        }

        for archive in &ordered {
            let name = archive.name();
            if merged.contains(name) {
                result.already_merged += 1;
                continue;
            }

            if !self.snapshots.has(archive) {
                debug!(table, archive = name, "Archive not stored yet, leaving it unmerged");
                result.not_stored += 1;
                continue;
            }

            let batch = self
                .snapshots
                .read(archive, table)
                .context(SnapshotReadSnafu {
                    archive: name,
                    table,
                })?;
            let Some(batch) = batch else {
                debug!(table, archive = name, "Archive has no rows for table");
                self.manifest
                    .record(table, [name])
                    .context(MergeManifestSnafu)?;
                merged.insert(name.to_string());
                result.absent += 1;
                continue;
            };

            let batch = self.drop_event_key(table, batch)?;
            let rows = batch.num_rows();
            let combined = match dataset.take() {
                Some(existing) => union_concat(table, &existing, &batch)?,
                None => union_concat(table, &empty_like(&batch), &batch)?,
            };
            contained.insert(name.to_string());

            write_batch(
                &path,
                &combined,
                self.compression,
                vec![(MERGED_ARCHIVES_KEY.to_string(), join_archives(&contained))],
            )
            .context(DatasetWriteSnafu { table })?;
            self.manifest
                .record(table, [name])
                .context(MergeManifestSnafu)?;

            emit!(RowsMerged {
                table: table.to_string(),
                count: rows as u64,
            });
            debug!(table, archive = name, rows, "Merged archive");

            merged.insert(name.to_string());
            result.merged.push(name.to_string());
            result.rows += rows;
            dataset = Some(combined);
        }

        if !result.merged.is_empty() {
            info!(
                table,
                archives = result.merged.len(),
                rows = result.rows,
                "Merged table"
            );
        }
        Ok(result)
    }

    /// Current dataset and the archives it already contains.
    fn load_dataset(
        &self,
        table: &str,
        path: &Path,
    ) -> Result<(Option<RecordBatch>, BTreeSet<String>), MergeError> {
        if !path.exists() {
            return Ok((None, BTreeSet::new()));
        }
        let contents = read_file(path).context(DatasetReadSnafu { table })?;
        let contained = contents
            .metadata_value(MERGED_ARCHIVES_KEY)
            .map(split_archives)
            .unwrap_or_default();
        Ok((Some(contents.batch), contained))
    }

    /// Remove the event key column. When it is the only column its values
    /// are blanked instead, so the table's rows are still appended.
    fn drop_event_key(
        &self,
        table: &str,
        mut batch: RecordBatch,
    ) -> Result<RecordBatch, MergeError> {
        let schema = batch.schema();
        let Some(index) = self
            .event_key
            .as_deref()
            .and_then(|key| schema.index_of(key).ok())
        else {
            return Ok(batch);
        };

        if batch.num_columns() > 1 {
            batch.remove_column(index);
            return Ok(batch);
        }
        let blank = new_null_array(schema.field(index).data_type(), batch.num_rows());
        RecordBatch::try_new(schema, vec![blank]).context(ConcatSnafu { table })
    }
}

fn join_archives(archives: &BTreeSet<String>) -> String {
    archives.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn split_archives(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn empty_like(batch: &RecordBatch) -> RecordBatch {
    RecordBatch::new_empty(batch.schema())
}

/// Append `incoming` to `existing` over the union of their columns.
///
/// Existing columns keep their position; new columns are appended. Cells
/// for columns a side lacks are null. A column with different types on the
/// two sides is a conflict.
fn union_concat(
    table: &str,
    existing: &RecordBatch,
    incoming: &RecordBatch,
) -> Result<RecordBatch, MergeError> {
    let existing_schema = existing.schema();
    let incoming_schema = incoming.schema();

    let mut fields: Vec<Field> = Vec::new();
    for field in existing_schema.fields() {
        if let Ok(other) = incoming_schema.field_with_name(field.name()) {
            ensure!(
                other.data_type() == field.data_type(),
                SchemaConflictSnafu {
                    table,
                    column: field.name().as_str(),
                    existing: field.data_type().to_string(),
                    incoming: other.data_type().to_string(),
                }
            );
        }
        fields.push(Field::new(field.name(), field.data_type().clone(), true));
    }
    for field in incoming_schema.fields() {
        if existing_schema.field_with_name(field.name()).is_err() {
            fields.push(Field::new(field.name(), field.data_type().clone(), true));
        }
    }
    let schema: SchemaRef = Arc::new(Schema::new(fields));

    let existing = align(&schema, existing).context(ConcatSnafu { table })?;
    let incoming = align(&schema, incoming).context(ConcatSnafu { table })?;
    concat_batches(&schema, [&existing, &incoming]).context(ConcatSnafu { table })
}

/// Re-shape `batch` to `schema`, filling absent columns with nulls.
fn align(schema: &SchemaRef, batch: &RecordBatch) -> Result<RecordBatch, arrow::error::ArrowError> {
    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| {
            batch
                .column_by_name(field.name())
                .cloned()
                .unwrap_or_else(|| new_null_array(field.data_type(), batch.num_rows()))
        })
        .collect();
    RecordBatch::try_new(schema.clone(), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveNaming;
    use crate::normalize::{ColumnData, TypedColumn, TypedTable};
    use arrow::array::{Array, StringArray};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        engine: MergeEngine,
        naming: ArchiveNaming,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let snapshots =
            SnapshotStore::open(dir.path().join("snapshots"), ParquetCompression::Snappy).unwrap();
        let engine = MergeEngine::open(
            snapshots,
            dir.path().join("datasets"),
            ParquetCompression::Snappy,
            Some("id".to_string()),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            engine,
            naming: ArchiveNaming::default(),
        }
    }

    fn text(name: &str, values: &[Option<&str>]) -> TypedColumn {
        TypedColumn {
            name: name.to_string(),
            data: ColumnData::Text(values.iter().map(|v| v.map(str::to_string)).collect()),
        }
    }

    fn records(columns: Vec<TypedColumn>) -> TypedTable {
        let num_rows = columns[0].data.len();
        TypedTable {
            name: "records".to_string(),
            columns,
            num_rows,
        }
    }

    impl Fixture {
        fn day(&self, day: u32) -> ArchiveId {
            self.naming
                .daily(NaiveDate::from_ymd_opt(2020, 1, day).unwrap())
        }

        fn store(&self, archive: &ArchiveId, tables: &[TypedTable]) {
            self.engine.snapshots().store(archive, tables).unwrap();
        }

        fn dataset(&self, table: &str) -> RecordBatch {
            read_file(&self.engine.dataset_path(table)).unwrap().batch
        }
    }

    fn strings(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
        let array = batch
            .column_by_name(column)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        (0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
            .collect()
    }

    #[test]
    fn test_merge_drops_event_key_and_keeps_order() {
        let f = fixture();
        let (d1, d2) = (f.day(1), f.day(2));
        f.store(
            &d1,
            &[records(vec![
                text("id", &[Some("A1"), Some("A2")]),
                text("case", &[Some("C1"), Some("C2")]),
            ])],
        );
        f.store(
            &d2,
            &[records(vec![text("id", &[Some("A3")]), text("case", &[Some("C3")])])],
        );

        let result = f.engine.merge("records", &[d2.clone(), d1.clone()]).unwrap();

        assert_eq!(result.merged, vec!["apc200101", "apc200102"]);
        assert_eq!(result.rows, 3);
        let dataset = f.dataset("records");
        assert!(dataset.column_by_name("id").is_none());
        assert_eq!(
            strings(&dataset, "case"),
            vec![Some("C1".to_string()), Some("C2".to_string()), Some("C3".to_string())]
        );
    }

    #[test]
    fn test_merge_twice_is_idempotent() {
        let f = fixture();
        let d1 = f.day(1);
        f.store(&d1, &[records(vec![text("id", &[Some("A1")]), text("case", &[Some("C1")])])]);

        f.engine.merge("records", &[d1.clone()]).unwrap();
        let second = f.engine.merge("records", &[d1.clone()]).unwrap();

        assert!(second.merged.is_empty());
        assert_eq!(second.already_merged, 1);
        assert_eq!(f.dataset("records").num_rows(), 1);
    }

    #[test]
    fn test_merge_pads_columns_across_archives() {
        let f = fixture();
        let (d1, d2) = (f.day(1), f.day(2));
        f.store(
            &d1,
            &[records(vec![text("case", &[Some("C1")]), text("status", &[Some("filed")])])],
        );
        f.store(
            &d2,
            &[records(vec![text("case", &[Some("C2")]), text("mark", &[Some("ACME")])])],
        );

        f.engine.merge("records", &[d1, d2]).unwrap();

        let dataset = f.dataset("records");
        let names: Vec<_> = dataset
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["case", "status", "mark"]);
        assert_eq!(strings(&dataset, "status"), vec![Some("filed".to_string()), None]);
        assert_eq!(strings(&dataset, "mark"), vec![None, Some("ACME".to_string())]);
    }

    #[test]
    fn test_archive_without_table_is_recorded() {
        let f = fixture();
        let d1 = f.day(1);
        f.store(&d1, &[]);

        let result = f.engine.merge("records", &[d1]).unwrap();

        assert_eq!(result.absent, 1);
        assert!(!f.engine.dataset_path("records").exists());
        assert!(f.engine.manifest().merged("records").unwrap().contains("apc200101"));
    }

    #[test]
    fn test_type_conflict_aborts_table() {
        let f = fixture();
        let (d1, d2) = (f.day(1), f.day(2));
        f.store(&d1, &[records(vec![text("when", &[Some("x")])])]);
        f.store(
            &d2,
            &[records(vec![TypedColumn {
                name: "when".to_string(),
                data: ColumnData::Date(vec![NaiveDate::from_ymd_opt(2020, 1, 2)]),
            }])],
        );

        let err = f.engine.merge("records", &[d1, d2]).unwrap_err();
        assert!(matches!(err, MergeError::SchemaConflict { ref column, .. } if column == "when"));
        assert_eq!(
            f.engine.manifest().merged("records").unwrap().len(),
            1,
            "first archive stays merged"
        );
    }

    #[test]
    fn test_reconciles_manifest_from_dataset_metadata() {
        let f = fixture();
        let (d1, d2) = (f.day(1), f.day(2));
        f.store(&d1, &[records(vec![text("case", &[Some("C1")])])]);
        f.store(&d2, &[records(vec![text("case", &[Some("C2")])])]);
        f.engine.merge("records", &[d1.clone()]).unwrap();

        // Simulate a crash after the dataset rename but before the manifest write.
        std::fs::remove_file(f.engine.manifest().path()).unwrap();
        let engine = MergeEngine::open(
            f.engine.snapshots().clone(),
            f.engine.dataset_root.clone(),
            ParquetCompression::Snappy,
            Some("id".to_string()),
        )
        .unwrap();

        let result = engine.merge("records", &[d1, d2]).unwrap();
        assert_eq!(result.reconciled, 1);
        assert_eq!(result.merged, vec!["apc200102"]);
        assert_eq!(
            strings(&f.dataset("records"), "case"),
            vec![Some("C1".to_string()), Some("C2".to_string())]
        );
    }

    #[test]
    fn test_unstored_archive_is_merged_once_stored() {
        let f = fixture();
        let d1 = f.day(1);

        let early = f.engine.merge("records", &[d1.clone()]).unwrap();
        assert_eq!(early.not_stored, 1);
        assert_eq!(early.absent, 0);
        assert!(f.engine.manifest().merged("records").unwrap().is_empty());

        f.store(&d1, &[records(vec![text("id", &[Some("A1")]), text("case", &[Some("C1")])])]);
        let result = f.engine.merge("records", &[d1]).unwrap();

        assert_eq!(result.merged, vec!["apc200101"]);
        assert_eq!(strings(&f.dataset("records"), "case"), vec![Some("C1".to_string())]);
    }

    #[test]
    fn test_table_of_only_event_keys_keeps_its_rows() {
        let f = fixture();
        let (d1, d2) = (f.day(1), f.day(2));
        f.store(&d1, &[records(vec![text("id", &[Some("A1"), Some("A2")])])]);
        f.store(
            &d2,
            &[records(vec![text("id", &[Some("A3")]), text("case", &[Some("C3")])])],
        );

        let result = f.engine.merge("records", &[d1, d2]).unwrap();

        assert_eq!(result.absent, 0);
        assert_eq!(result.rows, 3);
        let dataset = f.dataset("records");
        assert_eq!(dataset.num_rows(), 3);
        assert_eq!(strings(&dataset, "id"), vec![None, None, None]);
        assert_eq!(strings(&dataset, "case"), vec![None, None, Some("C3".to_string())]);
    }

    #[test]
    fn test_concurrent_merges_of_one_table_write_each_row_once() {
        let f = fixture();
        let ids: Vec<ArchiveId> = (1..=6).map(|d| f.day(d)).collect();
        for (i, id) in ids.iter().enumerate() {
            let case = format!("C{i}");
            f.store(
                id,
                &[records(vec![text("id", &[Some("A")]), text("case", &[Some(case.as_str())])])],
            );
        }

        let results: Vec<TableMerge> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| f.engine.merge("records", &ids).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().map(|r| r.rows).sum::<usize>(), 6);
        assert_eq!(results.iter().map(|r| r.merged.len()).sum::<usize>(), 6);
        let dataset = f.dataset("records");
        let expected: Vec<_> = (0..6).map(|i| Some(format!("C{i}"))).collect();
        assert_eq!(strings(&dataset, "case"), expected);
        assert_eq!(f.engine.manifest().merged("records").unwrap().len(), 6);
    }
}
