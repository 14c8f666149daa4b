//! Storage abstraction for archive sources.
//!
//! Archives are read from the local filesystem, a plain HTTP(S) server or
//! S3. Every backend is an `object_store` behind one provider, addressed by
//! paths relative to the configured base URL.

mod s3;

pub use s3::S3Config;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{HttpConfigSnafu, InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    BytesRead, RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider over one base location.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for different storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const HTTP_URL: &str = r"^(?P<url>https?://.+)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Http,
}

/// Matchers in precedence order; S3 HTTPS forms must win over plain HTTP.
static MATCHERS: LazyLock<Vec<(Backend, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("storage URL pattern is valid"))
            .collect()
    };
    vec![
        (
            Backend::S3,
            compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
        ),
        (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
        (Backend::Http, compile(&[HTTP_URL])),
    ]
});

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

/// Plain HTTP(S) configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub url: url::Url,
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Http(HttpConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// Strings without a scheme are filesystem paths, relative ones resolved
    /// against the working directory.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if !url.contains(':') && !url.is_empty() {
            let path = std::path::absolute(url).context(IoSnafu)?;
            return Ok(BackendConfig::Local(LocalConfig {
                path: path.to_string_lossy().into_owned(),
            }));
        }

        for (backend, patterns) in MATCHERS.iter() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                return match backend {
                    Backend::S3 => Self::parse_s3(&matches, url),
                    Backend::Local => Self::parse_local(&matches, url),
                    Backend::Http => Self::parse_http(&matches, url),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures, url: &str) -> Result<Self, StorageError> {
        let bucket = matches
            .name("bucket")
            .context(InvalidUrlSnafu { url })?
            .as_str()
            .to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_local(matches: &regex::Captures, url: &str) -> Result<Self, StorageError> {
        let path = matches.name("path").context(InvalidUrlSnafu { url })?.as_str();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    fn parse_http(matches: &regex::Captures, url: &str) -> Result<Self, StorageError> {
        let raw = matches.name("url").context(InvalidUrlSnafu { url })?.as_str();
        let url = url::Url::parse(raw)
            .ok()
            .context(InvalidUrlSnafu { url: raw })?;
        Ok(BackendConfig::Http(HttpConfig { url }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Http(_) | BackendConfig::Local(_) => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    ///
    /// Options are only meaningful for S3 (`aws_*` keys).
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Http(config) => Self::construct_http(config),
            BackendConfig::Local(config) => Self::construct_local(config),
        }
    }

    fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        let store = LocalFileSystem::new_with_prefix(&config.path).context(ObjectStoreSnafu)?;
        let canonical_url = format!("file://{}", config.path);
        Ok(Self {
            config: BackendConfig::Local(config),
            object_store: Arc::new(store),
            canonical_url,
        })
    }

    fn construct_http(config: HttpConfig) -> Result<Self, StorageError> {
        // A trailing slash keeps the last URL segment as a directory.
        let mut base = config.url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let store = HttpBuilder::new()
            .with_url(base.as_str())
            .build()
            .context(HttpConfigSnafu)?;
        Ok(Self {
            canonical_url: base.to_string(),
            config: BackendConfig::Http(config),
            object_store: Arc::new(store),
        })
    }

    /// Get the contents of a file relative to the base location.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        let status = if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        };
        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status,
        });

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;

        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });
        emit!(BytesRead {
            bytes: bytes.len() as u64,
        });
        debug!(path = %path, bytes = bytes.len(), "Read object from {}", self.canonical_url);
        Ok(bytes)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_s3_urls() {
        let config = BackendConfig::parse_url("s3://feeds/trademark/daily").unwrap();
        let BackendConfig::S3(s3) = config else {
            panic!("expected S3 backend");
        };
        assert_eq!(s3.bucket, "feeds");
        assert_eq!(s3.key.unwrap().as_ref(), "trademark/daily");

        let config =
            BackendConfig::parse_url("https://s3.us-east-1.amazonaws.com/feeds/x").unwrap();
        assert!(matches!(config, BackendConfig::S3(_)));
    }

    #[test]
    fn test_parse_http_url() {
        let config = BackendConfig::parse_url("https://bulkdata.example.org/trademark").unwrap();
        let BackendConfig::Http(http) = config else {
            panic!("expected HTTP backend");
        };
        assert_eq!(http.url.host_str(), Some("bulkdata.example.org"));
    }

    #[test]
    fn test_parse_local_forms() {
        for url in ["/data/archives", "file:///data/archives", "file:/data/archives"] {
            let config = BackendConfig::parse_url(url).unwrap();
            assert_eq!(
                config,
                BackendConfig::Local(LocalConfig {
                    path: "/data/archives".to_string()
                }),
                "{url}"
            );
        }

        let BackendConfig::Local(local) = BackendConfig::parse_url("archives").unwrap() else {
            panic!("expected local backend");
        };
        assert!(local.path.ends_with("archives"));
        assert!(local.path.starts_with('/'));
    }

    #[test]
    fn test_parse_invalid_url() {
        let err = BackendConfig::parse_url("ftp://example.org/x").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_local_get_and_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("apc200101.json"), b"{}").unwrap();

        let storage = StorageProvider::for_url_with_options(
            dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

        let bytes = storage.get("apc200101.json").await.unwrap();
        assert_eq!(&bytes[..], b"{}");

        let err = storage.get("apc200102.json").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
