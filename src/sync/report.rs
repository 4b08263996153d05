//! Sync report module.

use serde::Serialize;
use std::{fmt, ops};

/// Represents the changes applied in one direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Changes {
    pub copied: usize,
    pub deleted: usize,
    pub flags_added: usize,
    pub flags_removed: usize,
    pub labels_added: usize,
    pub labels_removed: usize,
    /// Represents the messages skipped after a failure or a refusal.
    pub skipped: usize,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ops::AddAssign for Changes {
    fn add_assign(&mut self, other: Self) {
        self.copied += other.copied;
        self.deleted += other.deleted;
        self.flags_added += other.flags_added;
        self.flags_removed += other.flags_removed;
        self.labels_added += other.labels_added;
        self.labels_removed += other.labels_removed;
        self.skipped += other.skipped;
    }
}

impl fmt::Display for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} copied, {} deleted, +{}/-{} flags, +{}/-{} labels, {} skipped",
            self.copied,
            self.deleted,
            self.flags_added,
            self.flags_removed,
            self.labels_added,
            self.labels_removed,
            self.skipped
        )
    }
}

/// Represents the outcome of the synchronization of one folder pair.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FolderReport {
    /// Represents the remote name of the folder.
    pub folder: String,
    pub to_local: Changes,
    pub to_remote: Changes,
    /// Is `true` when quick mode found nothing to do.
    pub unchanged: bool,
    /// Represents the failure that interrupted the passes.
    pub error: Option<String>,
}

impl FolderReport {
    pub fn new<F: ToString>(folder: F) -> Self {
        Self {
            folder: folder.to_string(),
            ..Self::default()
        }
    }
}

/// Represents the outcome of one synchronization cycle of an
/// account.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    pub account: String,
    pub folders: Vec<FolderReport>,
    pub created_folders: Vec<String>,
}

impl SyncReport {
    pub fn new<A: ToString>(account: A) -> Self {
        Self {
            account: account.to_string(),
            ..Self::default()
        }
    }

    pub fn to_local(&self) -> Changes {
        let mut total = Changes::default();
        for report in &self.folders {
            total += report.to_local;
        }
        total
    }

    pub fn to_remote(&self) -> Changes {
        let mut total = Changes::default();
        for report in &self.folders {
            total += report.to_remote;
        }
        total
    }

    /// Returns the folders whose synchronization was interrupted.
    pub fn failed_folders(&self) -> Vec<&str> {
        self.folders
            .iter()
            .filter(|report| report.error.is_some())
            .map(|report| report.folder.as_str())
            .collect()
    }
}
