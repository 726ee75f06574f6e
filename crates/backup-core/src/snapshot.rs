//! Snapshot engine: turns the live state into a verified archive.
//!
//! Flow for one snapshot:
//!
//! 1. Checkpoint the live data store so the data file is transactionally
//!    consistent.
//! 2. Build the manifest.
//! 3. Decide full vs incremental against the previous point (if any); bail
//!    out with [`SnapshotOutcome::NoChanges`] when nothing changed.
//! 4. Write the archive into the staging directory.
//! 5. Deep-verify the staged archive.
//! 6. Rename it into the archive directory.
//!
//! Any failure removes the staged file; nothing is catalogued here. The
//! caller inserts the returned point into the chain index.

use crate::archive::{write_archive, ArchiveHeader, ARCHIVE_EXTENSION, ARCHIVE_FORMAT};
use crate::catalog::SnapshotBase;
use crate::error::{BackupError, Result};
use crate::manifest::{diff, ManifestBuilder, ManifestDiff, ScanReport};
use crate::paths::{fsync_dir, BackupLayout, LiveLayout};
use crate::point::{display_name, ArchiveLocation, BackupPoint, PointKind, Trigger};
use crate::verify::{IntegrityVerifier, VerifyDepth};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Minimum free space kept on the backup volume after writing an archive.
const MIN_FREE_SPACE_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB

/// The live data store, as seen by the backup engine.
pub trait LiveStore: Send + Sync {
    /// Flush pending writes (e.g. a WAL checkpoint) so the data file on disk
    /// is consistent.
    fn checkpoint(&self) -> anyhow::Result<()>;
}

/// For when no store is open, e.g. at process start before login.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoint;

impl LiveStore for NoCheckpoint {
    fn checkpoint(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// When to start a new chain instead of extending the current one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FullBackupPolicy {
    /// Start a new chain once the current full point is this old.
    pub full_interval_days: Option<u32>,
    /// Start a new chain once the current one holds this many points.
    pub max_chain_length: Option<usize>,
    /// Start a new chain when this fraction of tracked files changed at once.
    pub max_changed_ratio: Option<f64>,
}

impl Default for FullBackupPolicy {
    fn default() -> Self {
        Self {
            full_interval_days: Some(7),
            max_chain_length: Some(30),
            max_changed_ratio: Some(0.5),
        }
    }
}

impl FullBackupPolicy {
    fn full_reason(&self, base: &SnapshotBase, changes: &ManifestDiff, now: DateTime<Utc>) -> Option<String> {
        if let Some(days) = self.full_interval_days {
            if now - base.chain_started_at >= Duration::days(days as i64) {
                return Some(format!("chain older than {days} day(s)"));
            }
        }
        if let Some(max) = self.max_chain_length {
            if base.chain_len >= max {
                return Some(format!("chain reached {max} point(s)"));
            }
        }
        if let Some(ratio) = self.max_changed_ratio {
            let tracked = base.effective.len().max(1) as f64;
            if changes.len() as f64 / tracked > ratio {
                return Some(format!("more than {:.0}% of files changed", ratio * 100.0));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub trigger: Trigger,
    pub force_full: bool,
}

impl SnapshotRequest {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            force_full: false,
        }
    }

    pub fn forced(trigger: Trigger) -> Self {
        Self {
            trigger,
            force_full: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Created { point: BackupPoint },
    NoChanges { previous_id: String },
}

impl SnapshotOutcome {
    pub fn created(&self) -> Option<&BackupPoint> {
        match self {
            SnapshotOutcome::Created { point } => Some(point),
            SnapshotOutcome::NoChanges { .. } => None,
        }
    }
}

pub struct SnapshotEngine {
    live: LiveLayout,
    store: BackupLayout,
    builder: ManifestBuilder,
    live_store: Arc<dyn LiveStore>,
    policy: FullBackupPolicy,
    verifier: IntegrityVerifier,
}

impl SnapshotEngine {
    pub fn new(
        live: LiveLayout,
        store: BackupLayout,
        live_store: Arc<dyn LiveStore>,
        policy: FullBackupPolicy,
    ) -> Self {
        Self {
            builder: ManifestBuilder::new(live.clone()),
            verifier: IntegrityVerifier::new(store.clone()),
            live,
            store,
            live_store,
            policy,
        }
    }

    pub fn policy(&self) -> &FullBackupPolicy {
        &self.policy
    }

    /// Take a snapshot on top of `base` (or a new full chain without one).
    ///
    /// `pre_restore` requests always produce a standalone full point, even
    /// when nothing changed.
    pub fn create_snapshot(&self, base: Option<&SnapshotBase>, request: SnapshotRequest) -> Result<SnapshotOutcome> {
        self.live_store
            .checkpoint()
            .map_err(|e| BackupError::SnapshotWrite(format!("data store checkpoint failed: {e:#}")))?;

        let scan = self.builder.build();
        let now = Utc::now();

        let draft = if request.trigger == Trigger::PreRestore {
            // an undo point missing live files would lose them for good
            let unreadable: Vec<String> = scan.unreadable().map(|s| s.path.clone()).collect();
            if !unreadable.is_empty() {
                return Err(BackupError::Scan(describe_paths("live item(s)", &unreadable)));
            }
            Draft::full(PointKind::PreRestore, &scan, now)
        } else {
            match base {
                None => Draft::full(PointKind::Full, &scan, now),
                Some(base) => {
                    let changes = diff(&base.effective, &scan);
                    if changes.is_empty() && !request.force_full {
                        info!(previous = %base.previous.id, "no changes since last backup");
                        return Ok(SnapshotOutcome::NoChanges {
                            previous_id: base.previous.id.clone(),
                        });
                    }
                    let reason = if request.force_full {
                        Some("full backup requested".to_string())
                    } else {
                        self.policy.full_reason(base, &changes, now)
                    };
                    let hidden = scan.hidden_by_unreadable(&base.effective);
                    match reason {
                        Some(reason) if hidden.is_empty() => {
                            info!(%reason, "starting a new backup chain");
                            Draft::full(PointKind::Full, &scan, now)
                        }
                        Some(_) if request.force_full => {
                            return Err(BackupError::Scan(describe_paths("backed-up file(s)", &hidden)));
                        }
                        Some(reason) => {
                            // only the current chain still has their content
                            warn!(
                                %reason,
                                unreadable = hidden.len(),
                                "extending the current chain instead of starting a new one"
                            );
                            Draft::incremental(base, changes, now)
                        }
                        None => Draft::incremental(base, changes, now),
                    }
                }
            }
        };

        let point = self.write_point(draft, request.trigger, &scan)?;
        info!(
            point = %point.id,
            kind = %point.kind,
            files = point.manifest.len(),
            tombstones = point.tombstones.len(),
            "backup point created"
        );
        Ok(SnapshotOutcome::Created { point })
    }

    fn write_point(&self, draft: Draft, trigger: Trigger, scan: &ScanReport) -> Result<BackupPoint> {
        let id = Uuid::new_v4().to_string();
        let file_name = format!("{id}.{ARCHIVE_EXTENSION}");
        let staged = self.store.staging.join(format!("{file_name}.partial"));
        let needed: u64 = draft.entries_bytes();
        check_disk_space(&self.store.staging, needed)?;

        let header = ArchiveHeader {
            format: ARCHIVE_FORMAT,
            point_id: id.clone(),
            chain_id: draft.chain_id.clone(),
            kind: draft.kind,
            created_at: draft.created_at,
            entries: draft.changes.changed.clone(),
            tombstones: draft.changes.removed.clone(),
        };

        let summary = match write_archive(&staged, &self.live.root, &header) {
            Ok(s) => s,
            Err(e) => {
                discard(&staged);
                return Err(match e {
                    BackupError::Io(io) => BackupError::SnapshotWrite(io.to_string()),
                    other => other,
                });
            }
        };

        let point = BackupPoint {
            display_name: display_name(
                draft.kind,
                draft.created_at,
                header.entries.len(),
                header.tombstones.len(),
            ),
            id,
            chain_id: draft.chain_id,
            parent_id: draft.parent_id,
            kind: draft.kind,
            trigger,
            created_at: draft.created_at,
            manifest: header.entries,
            tombstones: header.tombstones,
            skipped: scan.skipped.clone(),
            archive: ArchiveLocation {
                file_name: file_name.clone(),
                sha256: summary.sha256,
                size: summary.size,
            },
        };

        let verified = self
            .verifier
            .verify_archive_at(&staged, &point, VerifyDepth::Deep)
            .into_result();
        if let Err(e) = verified {
            warn!(point = %point.id, "discarding backup that failed verification");
            discard(&staged);
            return Err(e);
        }

        let dest = self.store.archive_path(&file_name);
        if let Err(e) = fs::rename(&staged, &dest) {
            discard(&staged);
            return Err(BackupError::SnapshotWrite(format!(
                "cannot move archive into place: {e}"
            )));
        }
        fsync_dir(&self.store.archives)?;
        Ok(point)
    }

    /// Remove `.partial` archives left behind by an interrupted snapshot.
    pub fn cleanup_staging(&self) {
        if let Ok(entries) = fs::read_dir(&self.store.staging) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(".partial") {
                    warn!(path = %entry.path().display(), "removing orphaned backup staging file");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

/// Everything about a point that is known before its archive exists.
struct Draft {
    kind: PointKind,
    chain_id: String,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    changes: ManifestDiff,
}

impl Draft {
    fn full(kind: PointKind, scan: &ScanReport, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            chain_id: Uuid::new_v4().to_string(),
            parent_id: None,
            created_at: now,
            changes: ManifestDiff {
                changed: scan.entries.clone(),
                removed: Vec::new(),
            },
        }
    }

    fn incremental(base: &SnapshotBase, changes: ManifestDiff, now: DateTime<Utc>) -> Self {
        // keep created_at strictly increasing within the chain
        let floor = base.previous.created_at + Duration::milliseconds(1);
        Self {
            kind: PointKind::Incremental,
            chain_id: base.previous.chain_id.clone(),
            parent_id: Some(base.previous.id.clone()),
            created_at: now.max(floor),
            changes,
        }
    }

    fn entries_bytes(&self) -> u64 {
        self.changes.changed.iter().map(|e| e.size).sum()
    }
}

fn describe_paths(what: &str, paths: &[String]) -> String {
    const SHOWN: usize = 5;
    let mut listed = paths.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if paths.len() > SHOWN {
        listed.push_str(&format!(" and {} more", paths.len() - SHOWN));
    }
    format!("{} {what} ({listed})", paths.len())
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "cannot remove staged archive: {e}");
        }
    }
}

/// Check that the filesystem containing `dir` has at least `needed` bytes plus
/// a safety margin (`MIN_FREE_SPACE_BYTES`) of free space.
fn check_disk_space(dir: &Path, needed: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let c_path = std::ffi::CString::new(dir.to_string_lossy().as_bytes())
            .map_err(|_| BackupError::Config("invalid path for statvfs".into()))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            let required = needed + MIN_FREE_SPACE_BYTES;
            if available < required {
                return Err(BackupError::SnapshotWrite(format!(
                    "insufficient disk space: need {} bytes, only {} available in {}",
                    required,
                    available,
                    dir.display()
                )));
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dir, needed);
    }
    Ok(())
}
