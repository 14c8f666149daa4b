//! Merge manifest.
//!
//! Records, per table, which archives are already folded into the combined
//! dataset. Persisted as `_manifest.json` next to the datasets:
//!
//! ```json
//! { "version": 1, "tables": { "records": ["apc200101", "apc200102"] } }
//! ```

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{
    ManifestError, ManifestLockSnafu, ManifestParseSnafu, ManifestReadSnafu,
    ManifestSerializeSnafu, ManifestWriteSnafu,
};

pub const MANIFEST_FILE: &str = "_manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeManifest {
    pub version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeSet<String>>,
}

impl Default for MergeManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            tables: BTreeMap::new(),
        }
    }
}

/// Shared handle to the persisted manifest.
///
/// Every update is written to disk before it becomes visible to readers.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    state: Mutex<MergeManifest>,
}

impl ManifestStore {
    /// Load the manifest in `dir`, starting empty when there is none.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let manifest = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context(ManifestParseSnafu {
                path: path.display().to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MergeManifest::default(),
            Err(e) => {
                return Err(e).context(ManifestReadSnafu {
                    path: path.display().to_string(),
                });
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(manifest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archives already merged into `table`.
    pub fn merged(&self, table: &str) -> Result<BTreeSet<String>, ManifestError> {
        let state = self.state.lock().map_err(|_| ManifestLockSnafu.build())?;
        Ok(state.tables.get(table).cloned().unwrap_or_default())
    }

    /// Add archives to `table` and persist. No-op when nothing is new.
    pub fn record<I>(&self, table: &str, archives: I) -> Result<(), ManifestError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut state = self.state.lock().map_err(|_| ManifestLockSnafu.build())?;

        let mut next = state.clone();
        let entry = next.tables.entry(table.to_string()).or_default();
        let before = entry.len();
        entry.extend(archives.into_iter().map(Into::into));
        if entry.len() == before {
            return Ok(());
        }

        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Snapshot of the whole manifest.
    pub fn snapshot(&self) -> Result<MergeManifest, ManifestError> {
        let state = self.state.lock().map_err(|_| ManifestLockSnafu.build())?;
        Ok(state.clone())
    }

    fn persist(&self, manifest: &MergeManifest) -> Result<(), ManifestError> {
        let json = serde_json::to_vec_pretty(manifest).context(ManifestSerializeSnafu)?;
        let tmp = self
            .path
            .with_file_name(format!(".{MANIFEST_FILE}.{}.tmp", Uuid::now_v7()));

        std::fs::write(&tmp, &json).context(ManifestWriteSnafu {
            path: tmp.display().to_string(),
        })?;
        std::fs::rename(&tmp, &self.path).context(ManifestWriteSnafu {
            path: self.path.display().to_string(),
        })
    }
}
