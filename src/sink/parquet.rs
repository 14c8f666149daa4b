//! Parquet encoding of typed tables.
//!
//! Text columns are `Utf8`, date columns `Date32`, all nullable. Files are
//! encoded in memory and land on disk through a temporary sibling and a
//! rename, so readers never see a partial file.

use arrow::array::{ArrayRef, Date32Array, RecordBatch, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use snafu::prelude::*;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::ParquetCompression;
use crate::emit;
use crate::error::{
    ArrowDecodeSnafu, ArrowEncodeSnafu, ColumnarError, ColumnarIoSnafu, ParquetReadSnafu,
    ParquetWriteSnafu,
};
use crate::metrics::events::ParquetWriteCompleted;
use crate::normalize::{ColumnData, TypedTable};

/// Extension of every columnar file.
pub const PARQUET_EXTENSION: &str = "parquet";

const UNIX_EPOCH: NaiveDate = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date");

/// Days since the Unix epoch, the `Date32` representation.
fn epoch_days(date: NaiveDate) -> i32 {
    // Dates within chrono's range fit comfortably in i32 days.
    date.signed_duration_since(UNIX_EPOCH).num_days() as i32
}

/// Encode a typed table as one record batch.
pub fn to_record_batch(table: &TypedTable) -> Result<RecordBatch, ColumnarError> {
    let mut fields = Vec::with_capacity(table.columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns.len());

    for column in &table.columns {
        match &column.data {
            ColumnData::Text(values) => {
                fields.push(Field::new(&column.name, DataType::Utf8, true));
                arrays.push(Arc::new(values.iter().map(|v| v.as_deref()).collect::<StringArray>()));
            }
            ColumnData::Date(values) => {
                fields.push(Field::new(&column.name, DataType::Date32, true));
                arrays.push(Arc::new(
                    values
                        .iter()
                        .map(|v| v.map(epoch_days))
                        .collect::<Date32Array>(),
                ));
            }
        }
    }

    let schema: SchemaRef = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, arrays).context(ArrowEncodeSnafu)
}

fn writer_properties(
    compression: ParquetCompression,
    metadata: Vec<(String, String)>,
) -> WriterProperties {
    let codec = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };

    let key_value_metadata = (!metadata.is_empty()).then(|| {
        metadata
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect()
    });

    WriterProperties::builder()
        .set_compression(codec)
        .set_key_value_metadata(key_value_metadata)
        .build()
}

/// Encode a batch as Parquet bytes, attaching file-level metadata.
pub fn encode(
    batch: &RecordBatch,
    compression: ParquetCompression,
    metadata: Vec<(String, String)>,
) -> Result<Bytes, ColumnarError> {
    let mut buffer = BytesMut::new().writer();
    let properties = writer_properties(compression, metadata);
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties))
        .context(ParquetWriteSnafu)?;
    writer.write(batch).context(ParquetWriteSnafu)?;
    writer.close().context(ParquetWriteSnafu)?;
    Ok(buffer.into_inner().freeze())
}

/// Write bytes to `path` through a temporary sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ColumnarError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    std::fs::write(&tmp, bytes).context(ColumnarIoSnafu {
        path: tmp.display().to_string(),
    })?;
    std::fs::rename(&tmp, path).context(ColumnarIoSnafu {
        path: path.display().to_string(),
    })
}

/// Encode `batch` and write it atomically to `path`.
pub fn write_batch(
    path: &Path,
    batch: &RecordBatch,
    compression: ParquetCompression,
    metadata: Vec<(String, String)>,
) -> Result<(), ColumnarError> {
    let start = Instant::now();
    let bytes = encode(batch, compression, metadata)?;
    write_atomic(path, &bytes)?;
    emit!(ParquetWriteCompleted {
        bytes: bytes.len() as u64,
        duration: start.elapsed(),
    });
    Ok(())
}

/// Contents of one Parquet file.
#[derive(Debug, Clone)]
pub struct ParquetContents {
    pub batch: RecordBatch,
    /// File-level key-value metadata.
    pub metadata: Vec<(String, String)>,
}

impl ParquetContents {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Read a whole Parquet file into one batch.
pub fn read_file(path: &Path) -> Result<ParquetContents, ColumnarError> {
    let file = File::open(path).context(ColumnarIoSnafu {
        path: path.display().to_string(),
    })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).context(ParquetReadSnafu)?;

    let metadata = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();
    // File metadata is returned separately, not carried on the schema.
    let schema: SchemaRef = Arc::new(Schema::new(builder.schema().fields().clone()));

    let reader = builder.build().context(ParquetReadSnafu)?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(ArrowDecodeSnafu)?;
    let batch = concat_batches(&schema, &batches).context(ArrowDecodeSnafu)?;

    Ok(ParquetContents { batch, metadata })
}
