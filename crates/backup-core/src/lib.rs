//! Backup and restore for the Casefile data directory.
//!
//! Snapshots of the data file and attachment tree are kept as full +
//! incremental chains of verified `tar.gz` archives. Restores are staged
//! first and swapped into place at the next start, after a safety backup of
//! the state being replaced.

pub mod archive;
pub mod catalog;
pub mod error;
pub mod history;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod point;
pub mod restore;
pub mod retention;
pub mod settings;
pub mod snapshot;
pub mod swap;
pub mod verify;

pub use catalog::{Chain, ChainIndex, Removal};
pub use error::{BackupError, Result};
pub use lock::{Operation, OperationLock};
pub use manager::BackupManager;
pub use manifest::{ManifestBuilder, ManifestEntry, ScanReport, SkipKind, SkippedEntry};
pub use point::{BackupPoint, PointKind, Trigger};
pub use restore::{ApplyOutcome, RestorePhase, RestoreState};
pub use retention::{RetentionPolicy, RetentionReport};
pub use settings::BackupSettings;
pub use snapshot::{FullBackupPolicy, LiveStore, NoCheckpoint, SnapshotOutcome, SnapshotRequest};
pub use verify::{VerificationResult, VerifyDepth};
