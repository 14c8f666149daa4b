//! Archive retrieval.
//!
//! The pipeline only depends on [`ArchiveFetcher`]. [`StorageFetcher`] is the
//! production implementation: it reads `{archive}{extension}` from a storage
//! provider, unpacks it and decodes the XML or JSON document.

mod compression;
mod document;
mod xml;

pub use compression::decompress;
pub use document::{Node, RawDocument};

use async_trait::async_trait;
use snafu::prelude::*;
use std::time::Instant;
use tracing::debug;

use crate::archive::ArchiveId;
use crate::config::{CompressionFormat, DocumentFormat, SourceConfig};
use crate::emit;
use crate::error::{DecodeSnafu, DecompressSnafu, FetchError, NotFoundSnafu, TransportSnafu};
use crate::metrics::events::{ArchiveFetchCompleted, DecompressionCompleted};
use crate::storage::StorageProviderRef;

/// Retrieves the raw document of one archive.
///
/// Implementations own any retry policy; callers treat every error as a
/// reason to skip the archive.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(&self, archive: &ArchiveId) -> Result<RawDocument, FetchError>;
}

/// Fetches archives from a storage provider.
#[derive(Debug, Clone)]
pub struct StorageFetcher {
    storage: StorageProviderRef,
    extension: String,
    compression: CompressionFormat,
    format: DocumentFormat,
}

impl StorageFetcher {
    pub fn new(storage: StorageProviderRef, config: &SourceConfig) -> Self {
        Self {
            storage,
            extension: config.extension.clone(),
            compression: config.compression,
            format: config.format,
        }
    }

    fn object_name(&self, archive: &ArchiveId) -> String {
        format!("{}{}", archive.name(), self.extension)
    }
}

#[async_trait]
impl ArchiveFetcher for StorageFetcher {
    async fn fetch(&self, archive: &ArchiveId) -> Result<RawDocument, FetchError> {
        let name = self.object_name(archive);
        let start = Instant::now();

        let compressed = match self.storage.get(name.as_str()).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return NotFoundSnafu {
                    archive: archive.name(),
                }
                .fail();
            }
            Err(e) => {
                return Err(e).context(TransportSnafu {
                    archive: archive.name(),
                });
            }
        };
        emit!(ArchiveFetchCompleted {
            duration: start.elapsed()
        });

        let decompress_start = Instant::now();
        let payload = decompress(self.compression, &compressed).context(DecompressSnafu {
            archive: archive.name(),
        })?;
        emit!(DecompressionCompleted {
            duration: decompress_start.elapsed()
        });
        debug!(
            archive = %archive,
            "Decompressed {} -> {} bytes",
            compressed.len(),
            payload.len()
        );

        RawDocument::decode(self.format, &payload).context(DecodeSnafu {
            archive: archive.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveNaming;
    use crate::storage::StorageProvider;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn source_config(url: &str) -> SourceConfig {
        SourceConfig {
            url: url.to_string(),
            extension: ".json.gz".to_string(),
            compression: CompressionFormat::Gzip,
            format: DocumentFormat::Json,
            storage_options: HashMap::new(),
            max_concurrent_archives: 1,
        }
    }

    async fn fetcher_with(
        dir: &TempDir,
        config: impl FnOnce(&str) -> SourceConfig,
    ) -> StorageFetcher {
        let url = dir.path().to_str().unwrap();
        let storage = StorageProvider::for_url_with_options(url, HashMap::new())
            .await
            .unwrap();
        StorageFetcher::new(Arc::new(storage), &config(url))
    }

    async fn fetcher(dir: &TempDir) -> StorageFetcher {
        fetcher_with(dir, source_config).await
    }

    fn write_gzip(dir: &TempDir, name: &str, content: &[u8]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        std::fs::write(dir.path().join(name), encoder.finish().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_decodes_document() {
        let dir = TempDir::new().unwrap();
        write_gzip(&dir, "apc18840407-20191231-01.json.gz", br#"{"records": [{"id": "A1"}]}"#);

        let archive = ArchiveNaming::default().historical(1);
        let document = fetcher(&dir).await.fetch(&archive).await.unwrap();

        assert!(document.root.as_map().unwrap().contains_key("records"));
    }

    #[tokio::test]
    async fn test_fetch_zipped_xml_document() {
        let dir = TempDir::new().unwrap();
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("apc200101.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(
                br#"<daily><filing><serial>1</serial></filing><filing><serial>2</serial></filing></daily>"#,
            )
            .unwrap();
        let zipped = writer.finish().unwrap().into_inner();
        std::fs::write(dir.path().join("apc200101.zip"), zipped).unwrap();

        let fetcher = fetcher_with(&dir, |url| SourceConfig {
            url: url.to_string(),
            extension: ".zip".to_string(),
            compression: CompressionFormat::Zip,
            format: DocumentFormat::Xml,
            storage_options: HashMap::new(),
            max_concurrent_archives: 1,
        })
        .await;
        let day = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let archive = ArchiveNaming::default().daily(day);
        let document = fetcher.fetch(&archive).await.unwrap();

        let daily = &document.root.as_map().unwrap()["daily"];
        assert!(matches!(
            &daily.as_map().unwrap()["filing"],
            Node::Seq(items) if items.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_missing_archive_is_not_found() {
        let dir = TempDir::new().unwrap();
        let archive = ArchiveNaming::default().historical(2);

        let err = fetcher(&dir).await.fetch(&archive).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_payloads() {
        let dir = TempDir::new().unwrap();
        let naming = ArchiveNaming::default();
        std::fs::write(dir.path().join("apc18840407-20191231-03.json.gz"), b"plain").unwrap();
        write_gzip(&dir, "apc18840407-20191231-04.json.gz", b"{\"records\": ");

        let fetcher = fetcher(&dir).await;
        let err = fetcher.fetch(&naming.historical(3)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decompress { .. }));

        let err = fetcher.fetch(&naming.historical(4)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
