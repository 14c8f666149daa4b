//! Outcomes of a pipeline run.

use std::fmt;

use crate::archive::ArchiveId;
use crate::dlq::FailureStats;
use crate::error::{FetchError, MergeError, SchemaError, SnapshotError};
use crate::merge::TableMerge;
use crate::metrics::events::FailureStage;

/// Why an archive was skipped.
#[derive(Debug)]
pub enum SkipReason {
    Fetch(FetchError),
    Schema(SchemaError),
    Store(SnapshotError),
}

impl SkipReason {
    pub fn stage(&self) -> FailureStage {
        match self {
            SkipReason::Fetch(_) => FailureStage::Fetch,
            SkipReason::Schema(_) => FailureStage::Schema,
            SkipReason::Store(_) => FailureStage::Store,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Fetch(e) => write!(f, "{e}"),
            SkipReason::Schema(e) => write!(f, "{e}"),
            SkipReason::Store(e) => write!(f, "{e}"),
        }
    }
}

/// What happened to one archive in the download stage.
#[derive(Debug)]
pub enum ArchiveOutcome {
    Stored {
        archive: ArchiveId,
        tables: usize,
        rows: usize,
    },
    /// The snapshot already existed; nothing was fetched.
    AlreadyStored { archive: ArchiveId },
    Skipped {
        archive: ArchiveId,
        reason: SkipReason,
    },
}

impl ArchiveOutcome {
    pub fn archive(&self) -> &ArchiveId {
        match self {
            ArchiveOutcome::Stored { archive, .. }
            | ArchiveOutcome::AlreadyStored { archive }
            | ArchiveOutcome::Skipped { archive, .. } => archive,
        }
    }
}

/// Result of the download stage, one outcome per handled archive.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Outcomes in archive order.
    pub outcomes: Vec<ArchiveOutcome>,
    /// Shutdown was requested before every archive was launched.
    pub cancelled: bool,
}

impl DownloadReport {
    pub fn stored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ArchiveOutcome::Stored { .. }))
            .count()
    }

    pub fn already_stored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ArchiveOutcome::AlreadyStored { .. }))
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&ArchiveId, &SkipReason)> {
        self.outcomes.iter().filter_map(|o| match o {
            ArchiveOutcome::Skipped { archive, reason } => Some((archive, reason)),
            _ => None,
        })
    }

    /// Skipped archives counted by the stage that failed.
    pub fn failures(&self) -> FailureStats {
        let mut stats = FailureStats::default();
        for (_, reason) in self.skipped() {
            stats.increment(reason.stage());
        }
        stats
    }

    pub fn rows(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                ArchiveOutcome::Stored { rows, .. } => *rows,
                _ => 0,
            })
            .sum()
    }
}

/// Result of the merge stage.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Tables merged without error, in table order.
    pub merged: Vec<TableMerge>,
    /// Tables whose merge aborted; other tables are unaffected.
    pub failed: Vec<(String, MergeError)>,
    /// Stored archives whose table list could not be read.
    pub unreadable: Vec<(String, SnapshotError)>,
    /// Shutdown was requested before every table was launched.
    pub cancelled: bool,
}

impl MergeReport {
    pub fn table(&self, name: &str) -> Option<&TableMerge> {
        self.merged.iter().find(|t| t.table == name)
    }
}

/// Combined result of a run; a stage that did not run is `None`.
#[derive(Debug, Default)]
pub struct RunReport {
    pub download: Option<DownloadReport>,
    pub merge: Option<MergeReport>,
}
