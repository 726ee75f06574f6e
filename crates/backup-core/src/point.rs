use crate::manifest::{ManifestEntry, SkippedEntry};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Full,
    Incremental,
    PreRestore,
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PointKind::Full => "full",
            PointKind::Incremental => "incremental",
            PointKind::PreRestore => "pre_restore",
        })
    }
}

/// What asked for a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Login,
    Logout,
    IdleTimeout,
    Manual,
    PreRestore,
}

impl Trigger {
    /// Lifecycle triggers are rate-limited by the configured backup interval;
    /// explicit requests are not.
    pub fn is_automatic(self) -> bool {
        matches!(self, Trigger::Login | Trigger::Logout | Trigger::IdleTimeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveLocation {
    /// File name inside the archive directory.
    pub file_name: String,
    /// SHA-256 of the archive file.
    pub sha256: String,
    pub size: u64,
}

/// One immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupPoint {
    pub id: String,
    pub chain_id: String,
    /// Previous point in the chain; `None` for full and pre-restore points.
    pub parent_id: Option<String>,
    pub kind: PointKind,
    pub trigger: Trigger,
    pub created_at: DateTime<Utc>,
    /// Entries this point contributes, sorted by path.
    pub manifest: Vec<ManifestEntry>,
    /// Paths removed since the previous point in the chain, sorted.
    #[serde(default)]
    pub tombstones: Vec<String>,
    /// Paths that could not be read when this point was taken.
    #[serde(default)]
    pub skipped: Vec<SkippedEntry>,
    pub archive: ArchiveLocation,
    pub display_name: String,
}

impl BackupPoint {
    pub fn is_safety(&self) -> bool {
        self.kind == PointKind::PreRestore
    }

    pub fn contributed_bytes(&self) -> u64 {
        self.manifest.iter().map(|e| e.size).sum()
    }
}

pub(crate) fn display_name(
    kind: PointKind,
    created_at: DateTime<Utc>,
    files: usize,
    removed: usize,
) -> String {
    let when = created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    match kind {
        PointKind::Full => format!("Full backup, {when} ({files} files)"),
        PointKind::Incremental if removed > 0 => {
            format!("Incremental, {when} ({files} changed, {removed} removed)")
        }
        PointKind::Incremental => format!("Incremental, {when} ({files} changed)"),
        PointKind::PreRestore => format!("Before restore, {when}"),
    }
}
