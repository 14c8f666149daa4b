//! Archive payload codecs.

use std::io::{self, Cursor, Read};

use crate::config::CompressionFormat;

/// Decompress a payload with the configured codec.
pub fn decompress(format: CompressionFormat, compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    match format {
        CompressionFormat::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(compressed);
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf)?;
            Ok(buf)
        }
        CompressionFormat::Zstd => zstd::decode_all(compressed),
        CompressionFormat::Zip => unzip_document(compressed),
        CompressionFormat::None => Ok(compressed.to_vec()),
    }
}

/// Extract the document from a zip container.
///
/// Feed containers hold a single document, sometimes next to a readme or a
/// DTD. The first `.xml` or `.json` entry wins, otherwise the first file.
fn unzip_document(compressed: &[u8]) -> io::Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(compressed)).map_err(io::Error::other)?;

    let mut document = None;
    let mut first_file = None;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(io::Error::other)?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        if name.ends_with(".xml") || name.ends_with(".json") {
            document = Some(index);
            break;
        }
        first_file.get_or_insert(index);
    }

    let index = document.or(first_file).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "zip container holds no files")
    })?;
    let mut entry = archive.by_index(index).map_err(io::Error::other)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const PAYLOAD: &[u8] = br#"{"records": []}"#;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(
            decompress(CompressionFormat::Gzip, &compressed).unwrap(),
            PAYLOAD
        );
    }

    #[test]
    fn test_zstd() {
        let compressed = zstd::encode_all(PAYLOAD, 3).unwrap();
        assert_eq!(
            decompress(CompressionFormat::Zstd, &compressed).unwrap(),
            PAYLOAD
        );
    }

    #[test]
    fn test_zip_picks_document_entry() {
        let compressed = zip_of(&[
            ("README.txt", b"feed notes"),
            ("apc200101.xml", b"<records/>"),
        ]);
        assert_eq!(
            decompress(CompressionFormat::Zip, &compressed).unwrap(),
            b"<records/>"
        );
    }

    #[test]
    fn test_zip_falls_back_to_first_file() {
        let compressed = zip_of(&[("payload", PAYLOAD), ("other", b"ignored")]);
        assert_eq!(
            decompress(CompressionFormat::Zip, &compressed).unwrap(),
            PAYLOAD
        );
    }

    #[test]
    fn test_empty_or_corrupt_zip_is_error() {
        assert!(decompress(CompressionFormat::Zip, &zip_of(&[])).is_err());
        assert!(decompress(CompressionFormat::Zip, b"not a zip").is_err());
    }

    #[test]
    fn test_corrupt_gzip_is_error() {
        assert!(decompress(CompressionFormat::Gzip, b"not gzip").is_err());
    }
}
