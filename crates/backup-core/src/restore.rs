//! Two-phase restore.
//!
//! `prepare` rebuilds the target state into `<live_root>/.casefile-restore/staged`
//! and writes a marker file next to the catalog. Nothing live is touched.
//! `apply` runs at the next process start, before the data store is opened:
//!
//! 1. Re-verify the staged tree.
//! 2. Take a `pre_restore` snapshot of the current live state, record its id
//!    in the marker and catalogue it.
//! 3. Flip the marker to `applying`.
//! 4. Swap the staged items into place by rename.
//! 5. Remove the work directory and the marker.
//!
//! A crash after step 3 leaves `applying` in the marker and the next start
//! rolls the swap forward from whatever is on disk.

use crate::archive::extract_archive;
use crate::catalog::ChainIndex;
use crate::error::{BackupError, Result};
use crate::manifest::EffectiveManifest;
use crate::paths::{write_atomic, BackupLayout, LiveLayout};
use crate::point::{BackupPoint, Trigger};
use crate::snapshot::{SnapshotEngine, SnapshotRequest};
use crate::swap::{SwapItem, TreeSwap};
use crate::verify::{IntegrityVerifier, VerifyDepth};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    /// Staged and verified, waiting for the next start.
    Prepared,
    /// Safety point taken, swap started.
    Applying,
    /// Gave up; live data is what it was before.
    Failed,
}

/// Restore marker persisted outside the live data store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreState {
    pub pending: bool,
    pub phase: RestorePhase,
    pub target_point_id: String,
    pub safety_point_id: Option<String>,
    pub prepared_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub failure: Option<String>,
    /// Ids of every point the target needs, oldest first.
    pub restore_set: Vec<String>,
    pub swap_items: Vec<SwapItem>,
}

impl RestoreState {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Points that must survive until this restore is done with them.
    pub fn protected_points(&self) -> HashSet<String> {
        if !self.pending {
            return HashSet::new();
        }
        self.restore_set.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    NothingPending,
    Applied {
        target_point_id: String,
        safety_point_id: Option<String>,
        /// Finished a swap an earlier process had started.
        resumed: bool,
    },
}

pub struct RestoreOrchestrator {
    live: LiveLayout,
    store: BackupLayout,
    verifier: IntegrityVerifier,
}

impl RestoreOrchestrator {
    pub fn new(live: LiveLayout, store: BackupLayout) -> Self {
        Self {
            verifier: IntegrityVerifier::new(store.clone()),
            live,
            store,
        }
    }

    pub fn state(&self) -> Result<Option<RestoreState>> {
        RestoreState::load(&self.store.restore_state)
    }

    /// Remove a work directory no marker refers to, left by a crash during
    /// `prepare`.
    pub fn cleanup_stale(&self) -> Result<()> {
        let work = self.live.restore_work_dir();
        if work.exists() && self.state()?.is_none() {
            warn!(path = %work.display(), "removing restore staging without a marker");
            remove_dir_if_exists(&work)?;
        }
        Ok(())
    }

    /// Points referenced by a pending restore.
    pub fn protected_points(&self) -> Result<HashSet<String>> {
        Ok(self
            .state()?
            .map(|s| s.protected_points())
            .unwrap_or_default())
    }

    /// Stage `target_id` for restore at the next start. Replaces a restore
    /// that is only prepared.
    pub fn prepare(&self, index: &ChainIndex, target_id: &str) -> Result<RestoreState> {
        if let Some(existing) = self.state()? {
            if existing.phase == RestorePhase::Applying {
                return Err(BackupError::RestoreInProgress);
            }
            if existing.pending {
                info!(previous = %existing.target_point_id, target = %target_id, "replacing prepared restore");
            }
        }

        let restore_set = index.restore_set(target_id)?;
        let expected = index.effective_manifest(target_id)?;
        for point in &restore_set {
            self.verifier.verify(point, VerifyDepth::Deep).into_result()?;
        }

        let work = self.live.restore_work_dir();
        remove_dir_if_exists(&work)?;
        let swap = TreeSwap::new(&self.live, self.swap_items(&expected));
        let staged = swap.staged_root().to_path_buf();
        if let Err(e) = self.stage(&staged, &restore_set, &expected) {
            warn!(target = %target_id, "staging restore failed: {e}");
            remove_dir_if_exists(&work)?;
            return Err(e);
        }

        let now = Utc::now();
        let mut state = RestoreState {
            pending: true,
            phase: RestorePhase::Prepared,
            target_point_id: target_id.to_string(),
            safety_point_id: None,
            prepared_at: now,
            updated_at: now,
            failure: None,
            restore_set: restore_set.iter().map(|p| p.id.clone()).collect(),
            swap_items: self.swap_items(&expected),
        };
        state.save(&self.store.restore_state)?;
        info!(
            target = %target_id,
            points = restore_set.len(),
            files = expected.len(),
            "restore prepared; it will be applied at the next start"
        );
        Ok(state)
    }

    fn swap_items(&self, expected: &EffectiveManifest) -> Vec<SwapItem> {
        vec![
            SwapItem {
                name: self.live.data_file.clone(),
                in_target: expected.contains_key(&self.live.data_file),
            },
            SwapItem {
                name: self.live.attachments_dir.clone(),
                in_target: true,
            },
        ]
    }

    fn stage(&self, staged: &Path, restore_set: &[BackupPoint], expected: &EffectiveManifest) -> Result<()> {
        fs::create_dir_all(staged)?;
        for point in restore_set {
            extract_archive(&self.store.archive_path(&point.archive.file_name), staged)?;
            for path in &point.tombstones {
                let target = LiveLayout::resolve_under(staged, path)?;
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        fs::create_dir_all(staged.join(&self.live.attachments_dir))?;
        IntegrityVerifier::verify_tree(staged, &self.live.tracked_items(), expected).into_result()?;
        Ok(())
    }

    /// Drop a prepared (or failed) restore.
    pub fn cancel(&self) -> Result<RestoreState> {
        let state = self.state()?.ok_or(BackupError::RestoreNotPending)?;
        if state.phase == RestorePhase::Applying {
            return Err(BackupError::RestoreInProgress);
        }
        remove_dir_if_exists(&self.live.restore_work_dir())?;
        RestoreState::clear(&self.store.restore_state)?;
        info!(target = %state.target_point_id, "restore cancelled");
        Ok(state)
    }

    /// Apply or resume a pending restore. Call at process start, before the
    /// live data store is opened.
    pub fn apply(&self, index: &mut ChainIndex, engine: &SnapshotEngine) -> Result<ApplyOutcome> {
        let Some(state) = self.state()? else {
            return Ok(ApplyOutcome::NothingPending);
        };
        match state.phase {
            RestorePhase::Failed => Ok(ApplyOutcome::NothingPending),
            RestorePhase::Applying => {
                warn!(target = %state.target_point_id, "resuming interrupted restore");
                let swap = TreeSwap::new(&self.live, state.swap_items.clone());
                self.finish(state, swap, true)
            }
            RestorePhase::Prepared => {
                let (state, swap) = self.begin(state, index, engine)?;
                self.finish(state, swap, false)
            }
        }
    }

    /// Everything up to and including the `applying` marker.
    fn begin(
        &self,
        mut state: RestoreState,
        index: &mut ChainIndex,
        engine: &SnapshotEngine,
    ) -> Result<(RestoreState, TreeSwap)> {
        let swap = TreeSwap::new(&self.live, state.swap_items.clone());

        let checked = index
            .effective_manifest(&state.target_point_id)
            .and_then(|expected| {
                IntegrityVerifier::verify_tree(swap.staged_root(), &self.live.tracked_items(), &expected)
                    .into_result()
            });
        if let Err(e) = checked {
            error!(target = %state.target_point_id, "staged restore is no longer valid: {e}");
            self.mark_failed(&mut state, &e)?;
            remove_dir_if_exists(&self.live.restore_work_dir())?;
            return Err(e);
        }

        let safety = match self.take_safety_point(&mut state, index, engine) {
            Ok(point) => point,
            Err(e) => {
                // stays prepared; the next start tries again
                error!("safety backup failed, restore postponed: {e}");
                state.failure = Some(e.to_string());
                state.save(&self.store.restore_state)?;
                return Err(e);
            }
        };

        state.phase = RestorePhase::Applying;
        state.failure = None;
        state.save(&self.store.restore_state)?;
        info!(target = %state.target_point_id, safety = %safety.id, "safety backup taken, swapping live data");
        Ok((state, swap))
    }

    /// The undo point for this restore. Its id reaches the marker before the
    /// catalog, so a retry after a crash in between reuses the catalogued
    /// point. An id the catalog never got refers to an orphaned archive and is
    /// replaced.
    fn take_safety_point(
        &self,
        state: &mut RestoreState,
        index: &mut ChainIndex,
        engine: &SnapshotEngine,
    ) -> Result<BackupPoint> {
        if let Some(existing) = state.safety_point_id.as_deref().and_then(|id| index.get(id)) {
            let existing = existing.clone();
            if index.safety_hold(&existing.id).is_none() {
                index.add_safety_hold(&existing.id, Utc::now());
                index.save(&self.store.catalog)?;
            }
            info!(safety = %existing.id, "reusing safety backup from an interrupted attempt");
            return Ok(existing);
        }

        let safety = engine
            .create_snapshot(None, SnapshotRequest::new(Trigger::PreRestore))?
            .created()
            .cloned()
            .ok_or_else(|| BackupError::SnapshotWrite("safety backup was not created".into()))?;
        state.safety_point_id = Some(safety.id.clone());
        state.save(&self.store.restore_state)?;

        index.insert(safety.clone())?;
        index.add_safety_hold(&safety.id, Utc::now());
        index.save(&self.store.catalog)?;
        Ok(safety)
    }

    fn finish(&self, mut state: RestoreState, swap: TreeSwap, resumed: bool) -> Result<ApplyOutcome> {
        match swap.run() {
            Ok(_) => {
                remove_dir_if_exists(&self.live.restore_work_dir())?;
                RestoreState::clear(&self.store.restore_state)?;
                info!(target = %state.target_point_id, resumed, "restore applied");
                Ok(ApplyOutcome::Applied {
                    target_point_id: state.target_point_id,
                    safety_point_id: state.safety_point_id,
                    resumed,
                })
            }
            Err(swap_err) => match swap.revert() {
                Ok(()) => {
                    error!(target = %state.target_point_id, "restore swap failed and was reverted: {swap_err}");
                    self.mark_failed(&mut state, &swap_err)?;
                    remove_dir_if_exists(&self.live.restore_work_dir())?;
                    Err(BackupError::RestoreFailed(swap_err.to_string()))
                }
                Err(revert_err) => {
                    // marker stays `applying`; the next start rolls forward
                    error!(
                        target = %state.target_point_id,
                        "restore swap failed ({swap_err}) and could not be reverted: {revert_err}"
                    );
                    Err(swap_err)
                }
            },
        }
    }

    fn mark_failed(&self, state: &mut RestoreState, cause: &BackupError) -> Result<()> {
        state.pending = false;
        state.phase = RestorePhase::Failed;
        state.failure = Some(cause.to_string());
        state.save(&self.store.restore_state)
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::PointKind;
    use crate::snapshot::{FullBackupPolicy, NoCheckpoint};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        live: LiveLayout,
        store: BackupLayout,
        engine: SnapshotEngine,
        orchestrator: RestoreOrchestrator,
        index: ChainIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let live = LiveLayout::new(dir.path().join("live"), "casefile.db", "attachments");
            fs::create_dir_all(live.attachments_path()).unwrap();
            let store = BackupLayout::new(dir.path().join("backups"));
            store.ensure().unwrap();
            let policy = FullBackupPolicy {
                max_changed_ratio: None,
                ..FullBackupPolicy::default()
            };
            Self {
                engine: SnapshotEngine::new(live.clone(), store.clone(), Arc::new(NoCheckpoint), policy),
                orchestrator: RestoreOrchestrator::new(live.clone(), store.clone()),
                index: ChainIndex::new(),
                _dir: dir,
                live,
                store,
            }
        }

        fn snapshot(&mut self) -> BackupPoint {
            let base = self
                .index
                .latest_chain_head()
                .map(|p| self.index.snapshot_base(&p.id).unwrap());
            let point = self
                .engine
                .create_snapshot(base.as_ref(), SnapshotRequest::new(Trigger::Manual))
                .unwrap()
                .created()
                .cloned()
                .unwrap();
            self.index.insert(point.clone()).unwrap();
            point
        }

        fn write(&self, rel: &str, body: &str) {
            let path = self.live.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }

        fn read(&self, rel: &str) -> Option<String> {
            fs::read_to_string(self.live.root.join(rel)).ok()
        }

        fn safety_points(&self) -> usize {
            self.index.points().filter(|p| p.kind == PointKind::PreRestore).count()
        }
    }

    #[test]
    fn prepare_then_apply_restores_target() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "db-1");
        fx.write("attachments/a.txt", "a");
        fx.write("attachments/b.txt", "b");
        let first = fx.snapshot();

        fx.write("casefile.db", "db-2");
        fs::remove_file(fx.live.root.join("attachments/b.txt")).unwrap();
        fx.write("attachments/c.txt", "c");
        fx.snapshot();

        let state = fx.orchestrator.prepare(&fx.index, &first.id).unwrap();
        assert_eq!(state.phase, RestorePhase::Prepared);
        // nothing live changes until apply
        assert_eq!(fx.read("casefile.db").as_deref(), Some("db-2"));

        let outcome = fx.orchestrator.apply(&mut fx.index, &fx.engine).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { resumed: false, .. }));
        assert_eq!(fx.read("casefile.db").as_deref(), Some("db-1"));
        assert_eq!(fx.read("attachments/b.txt").as_deref(), Some("b"));
        assert_eq!(fx.read("attachments/c.txt"), None);
        assert_eq!(fx.safety_points(), 1);
        assert!(fx.orchestrator.state().unwrap().is_none());
        assert!(!fx.live.restore_work_dir().exists());

        // the catalog on disk already has the safety point
        let reloaded = ChainIndex::load(&fx.store.catalog).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.points().filter(|p| p.is_safety()).count(), 1);
    }

    #[test]
    fn interrupted_apply_rolls_forward_without_second_safety_point() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "old");
        fx.write("attachments/a.txt", "a");
        let target = fx.snapshot();
        fx.write("casefile.db", "new");
        fx.write("attachments/a.txt", "a2");

        fx.orchestrator.prepare(&fx.index, &target.id).unwrap();
        let state = fx.orchestrator.state().unwrap().unwrap();
        let (_, swap) = fx.orchestrator.begin(state, &mut fx.index, &fx.engine).unwrap();
        let steps = swap.pending_steps();
        swap.run_step(&steps[0]).unwrap();
        swap.run_step(&steps[1]).unwrap();
        swap.run_step(&steps[2]).unwrap();
        drop(swap);

        let on_disk = fx.orchestrator.state().unwrap().unwrap();
        assert_eq!(on_disk.phase, RestorePhase::Applying);
        assert!(on_disk.safety_point_id.is_some());

        let outcome = fx.orchestrator.apply(&mut fx.index, &fx.engine).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { resumed: true, .. }));
        assert_eq!(fx.read("casefile.db").as_deref(), Some("old"));
        assert_eq!(fx.read("attachments/a.txt").as_deref(), Some("a"));
        assert_eq!(fx.safety_points(), 1);
    }

    #[test]
    fn retry_reuses_catalogued_safety_point() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "old");
        let target = fx.snapshot();
        fx.write("casefile.db", "new");
        fx.orchestrator.prepare(&fx.index, &target.id).unwrap();

        // the process dies after cataloguing the safety point, before `applying`
        let mut state = fx.orchestrator.state().unwrap().unwrap();
        let safety = fx
            .orchestrator
            .take_safety_point(&mut state, &mut fx.index, &fx.engine)
            .unwrap();
        let on_disk = fx.orchestrator.state().unwrap().unwrap();
        assert_eq!(on_disk.phase, RestorePhase::Prepared);
        assert_eq!(on_disk.safety_point_id.as_deref(), Some(safety.id.as_str()));

        let mut index = ChainIndex::load(&fx.store.catalog).unwrap();
        match fx.orchestrator.apply(&mut index, &fx.engine).unwrap() {
            ApplyOutcome::Applied { safety_point_id, resumed, .. } => {
                assert_eq!(safety_point_id.as_deref(), Some(safety.id.as_str()));
                assert!(!resumed);
            }
            other => panic!("expected applied, got {other:?}"),
        }
        assert_eq!(index.points().filter(|p| p.kind == PointKind::PreRestore).count(), 1);
        assert!(index.safety_hold(&safety.id).is_some());
        assert_eq!(fx.read("casefile.db").as_deref(), Some("old"));
    }

    #[test]
    fn unreadable_live_file_postpones_apply() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "old");
        let target = fx.snapshot();
        fx.orchestrator.prepare(&fx.index, &target.id).unwrap();

        // the scan cannot read a data file that turned into a directory
        fs::remove_file(fx.live.data_file_path()).unwrap();
        fs::create_dir_all(fx.live.data_file_path().join("inner")).unwrap();

        let err = fx.orchestrator.apply(&mut fx.index, &fx.engine).unwrap_err();
        assert!(matches!(err, BackupError::Scan(_)));
        let state = fx.orchestrator.state().unwrap().unwrap();
        assert_eq!(state.phase, RestorePhase::Prepared);
        assert!(state.failure.is_some());
        assert_eq!(fx.safety_points(), 0);
        assert!(fx.live.data_file_path().join("inner").is_dir());
    }

    #[test]
    fn corrupt_archive_blocks_prepare() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "db");
        let point = fx.snapshot();
        let archive = fx.store.archive_path(&point.archive.file_name);
        let mut bytes = fs::read(&archive).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&archive, bytes).unwrap();

        let err = fx.orchestrator.prepare(&fx.index, &point.id).unwrap_err();
        assert!(matches!(err, BackupError::Integrity { .. }));
        assert!(fx.orchestrator.state().unwrap().is_none());
        assert!(!fx.live.restore_work_dir().exists());
        assert_eq!(fx.read("casefile.db").as_deref(), Some("db"));
    }

    #[test]
    fn tampered_staging_fails_before_live_changes() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "old");
        let target = fx.snapshot();
        fx.write("casefile.db", "new");

        fx.orchestrator.prepare(&fx.index, &target.id).unwrap();
        fs::write(fx.live.restore_work_dir().join("staged/casefile.db"), "evil").unwrap();

        let err = fx.orchestrator.apply(&mut fx.index, &fx.engine).unwrap_err();
        assert!(matches!(err, BackupError::Integrity { .. }));
        assert_eq!(fx.read("casefile.db").as_deref(), Some("new"));
        assert_eq!(fx.safety_points(), 0);
        let state = fx.orchestrator.state().unwrap().unwrap();
        assert_eq!(state.phase, RestorePhase::Failed);
        assert!(!state.pending);
    }

    #[test]
    fn cancel_only_while_not_applying() {
        let mut fx = Fixture::new();
        fx.write("casefile.db", "db");
        let point = fx.snapshot();

        assert!(matches!(fx.orchestrator.cancel(), Err(BackupError::RestoreNotPending)));

        fx.orchestrator.prepare(&fx.index, &point.id).unwrap();
        assert!(fx.orchestrator.protected_points().unwrap().contains(&point.id));
        fx.orchestrator.cancel().unwrap();
        assert!(fx.orchestrator.state().unwrap().is_none());
        assert!(!fx.live.restore_work_dir().exists());

        fx.orchestrator.prepare(&fx.index, &point.id).unwrap();
        let state = fx.orchestrator.state().unwrap().unwrap();
        fx.orchestrator.begin(state, &mut fx.index, &fx.engine).unwrap();
        assert!(matches!(fx.orchestrator.cancel(), Err(BackupError::RestoreInProgress)));
        assert!(matches!(
            fx.orchestrator.prepare(&fx.index, &point.id),
            Err(BackupError::RestoreInProgress)
        ));
    }

    #[test]
    fn stale_staging_without_marker_is_removed() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.live.restore_work_dir().join("staged")).unwrap();
        fx.orchestrator.cleanup_stale().unwrap();
        assert!(!fx.live.restore_work_dir().exists());
    }

    #[test]
    fn apply_without_marker_is_a_no_op() {
        let mut fx = Fixture::new();
        let outcome = fx.orchestrator.apply(&mut fx.index, &fx.engine).unwrap();
        assert!(matches!(outcome, ApplyOutcome::NothingPending));
    }
}
