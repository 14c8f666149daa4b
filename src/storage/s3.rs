//! S3 archive source.

use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{S3ConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// S3 location of the archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    /// Prefix under which the archive objects live.
    pub key: Option<Path>,
}

impl S3Config {
    /// Human-readable location used in logs.
    pub fn canonical_url(&self) -> String {
        let base = match (&self.endpoint, &self.region) {
            (Some(endpoint), _) => format!("s3::{}/{}", endpoint, self.bucket),
            (None, Some(region)) => format!("https://s3.{}.amazonaws.com/{}", region, self.bucket),
            (None, None) => format!("https://s3.amazonaws.com/{}", self.bucket),
        };
        match &self.key {
            Some(key) => format!("{base}/{key}"),
            None => base,
        }
    }
}

impl StorageProvider {
    /// Public feeds are read without signing unless credentials are present,
    /// either in the environment or in `options`.
    pub(super) fn construct_s3(
        config: S3Config,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_retry(RetryConfig::default());

        let mut has_credentials = std::env::var_os("AWS_ACCESS_KEY_ID").is_some();
        for (key, value) in &options {
            let key: AmazonS3ConfigKey = key.parse().context(S3ConfigSnafu)?;
            has_credentials |= matches!(key, AmazonS3ConfigKey::AccessKeyId);
            builder = builder.with_config(key, value.clone());
        }
        if !has_credentials {
            builder = builder.with_skip_signature(true);
        }

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(S3ConfigSnafu)?);

        Ok(Self {
            canonical_url: config.canonical_url(),
            config: BackendConfig::S3(config),
            object_store,
        })
    }
}
