use crate::lock::Operation;

/// Result type for backup and restore operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors surfaced by the backup subsystem.
///
/// Unreadable files during a scan are normally not errors: they are recorded
/// as [`crate::manifest::SkippedEntry`] and the scan continues. `Scan` is only
/// raised when a snapshot built from an incomplete scan would drop content
/// that exists nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{0} could not be read; fix access to them and try again")]
    Scan(String),

    #[error("backup could not be written: {0}")]
    SnapshotWrite(String),

    #[error("integrity check failed for {subject}: {detail}")]
    Integrity { subject: String, detail: String },

    #[error(
        "backup point {point_id} has {dependents} dependent backup(s); delete them first or confirm cascade deletion"
    )]
    DependencyViolation { point_id: String, dependents: usize },

    #[error("{running} already in progress; try again when it finishes")]
    Busy { running: Operation },

    #[error("backup point not found: {0}")]
    PointNotFound(String),

    #[error("backup point {0} is part of the pending restore; cancel the restore first")]
    PointInUse(String),

    #[error("no restore is pending")]
    RestoreNotPending,

    #[error("restore is already being applied; it cannot be changed or cancelled")]
    RestoreInProgress,

    #[error("restore failed and live data was reverted: {0}")]
    RestoreFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    pub(crate) fn integrity(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}
