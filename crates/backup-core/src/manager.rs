//! Operator-facing entry point.
//!
//! `BackupManager` owns the catalog and wires the snapshot engine, retention
//! and restore orchestrator behind one [`OperationLock`]. Hosts call
//! [`BackupManager::apply_pending_restore`] once at start, before opening the
//! data store, and [`BackupManager::on_lifecycle`] on login, logout and idle
//! timeout.

use crate::catalog::{Chain, ChainIndex, Removal};
use crate::error::{BackupError, Result};
use crate::history::{EventSeverity, HistoryEntry, HistoryLog};
use crate::lock::{Operation, OperationLock};
use crate::paths::{classify_storage, BackupLayout, LiveLayout, StorageKind};
use crate::point::{BackupPoint, Trigger};
use crate::restore::{ApplyOutcome, RestoreOrchestrator, RestoreState};
use crate::retention::{RetentionEnforcer, RetentionReport};
use crate::settings::BackupSettings;
use crate::snapshot::{LiveStore, SnapshotEngine, SnapshotOutcome, SnapshotRequest};
use crate::verify::{IntegrityVerifier, VerificationResult, VerifyDepth};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct BackupManager {
    settings: BackupSettings,
    store: BackupLayout,
    storage: StorageKind,
    index: Mutex<ChainIndex>,
    lock: Arc<OperationLock>,
    engine: SnapshotEngine,
    verifier: IntegrityVerifier,
    orchestrator: RestoreOrchestrator,
    retention: RetentionEnforcer,
    history: HistoryLog,
}

impl BackupManager {
    pub fn open(settings: BackupSettings, live_store: Arc<dyn LiveStore>) -> Result<Self> {
        Self::open_with_lock(settings, live_store, OperationLock::new())
    }

    /// Open with a caller-supplied lock, shared with other components.
    pub fn open_with_lock(
        settings: BackupSettings,
        live_store: Arc<dyn LiveStore>,
        lock: Arc<OperationLock>,
    ) -> Result<Self> {
        settings.validate()?;
        let live = settings.live_layout()?;
        let store = settings.backup_layout()?;
        store.ensure()?;

        let storage = classify_storage(&store.root);
        match &storage {
            StorageKind::CloudSync(provider) => warn!(
                dir = %store.root.display(),
                %provider,
                "backup directory is inside a cloud-sync folder; archives will leave this machine"
            ),
            StorageKind::Local => info!(dir = %store.root.display(), "backup directory is local"),
        }

        let index = ChainIndex::load(&store.catalog)?;
        let engine = SnapshotEngine::new(
            live.clone(),
            store.clone(),
            live_store,
            settings.full_policy.clone(),
        );
        engine.cleanup_staging();
        remove_orphan_archives(&store, &index);

        let history = HistoryLog::new(&store.history, settings.history_max_bytes)?;
        if let Some(seq) = history.verify_chain()? {
            warn!(seq, "backup history chain is broken");
        }

        let orchestrator = RestoreOrchestrator::new(live.clone(), store.clone());
        orchestrator.cleanup_stale()?;

        info!(points = index.len(), live = %live.root.display(), "backup manager ready");
        Ok(Self {
            verifier: IntegrityVerifier::new(store.clone()),
            orchestrator,
            retention: RetentionEnforcer::new(settings.retention.clone()),
            index: Mutex::new(index),
            settings,
            store,
            storage,
            lock,
            engine,
            history,
        })
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn live_layout(&self) -> Result<LiveLayout> {
        self.settings.live_layout()
    }

    pub fn storage_kind(&self) -> &StorageKind {
        &self.storage
    }

    pub fn lock(&self) -> Arc<OperationLock> {
        Arc::clone(&self.lock)
    }

    /// Every chain, newest first; points inside a chain oldest first.
    pub fn list_points(&self) -> Vec<Chain> {
        self.index
            .lock()
            .chains_newest_first()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn point(&self, point_id: &str) -> Result<BackupPoint> {
        self.index
            .lock()
            .get(point_id)
            .cloned()
            .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))
    }

    pub fn dependents_of(&self, point_id: &str) -> Result<usize> {
        self.index.lock().dependents_of(point_id)
    }

    pub fn create_snapshot(&self, request: SnapshotRequest) -> Result<SnapshotOutcome> {
        let _permit = self.lock.try_acquire(Operation::Snapshot)?;
        self.snapshot_locked(request)
    }

    /// Run [`create_snapshot`](Self::create_snapshot) on the blocking pool.
    /// Must be called from within a tokio runtime.
    pub fn create_snapshot_background(
        self: &Arc<Self>,
        request: SnapshotRequest,
    ) -> JoinHandle<Result<SnapshotOutcome>> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.create_snapshot(request))
    }

    fn snapshot_locked(&self, request: SnapshotRequest) -> Result<SnapshotOutcome> {
        let base = {
            let index = self.index.lock();
            match index.latest_chain_head() {
                Some(head) => Some(index.snapshot_base(&head.id)?),
                None => None,
            }
        };

        let outcome = match self.engine.create_snapshot(base.as_ref(), request) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(trigger = ?request.trigger, "backup failed: {e}");
                self.record(
                    "BACKUP_FAILED",
                    EventSeverity::Error,
                    json!({ "trigger": request.trigger, "error": e.to_string() }),
                );
                return Err(e);
            }
        };

        match &outcome {
            SnapshotOutcome::Created { point } => {
                {
                    let mut index = self.index.lock();
                    index.insert(point.clone())?;
                    if point.is_safety() {
                        index.add_safety_hold(&point.id, point.created_at);
                    }
                    index.save(&self.store.catalog)?;
                }
                if !point.skipped.is_empty() {
                    warn!(point = %point.id, skipped = point.skipped.len(), "some files could not be read");
                }
                self.record(
                    "BACKUP_CREATED",
                    EventSeverity::Info,
                    json!({
                        "point_id": point.id,
                        "kind": point.kind,
                        "trigger": point.trigger,
                        "files": point.manifest.len(),
                        "tombstones": point.tombstones.len(),
                        "skipped": point.skipped.len(),
                        "bytes": point.archive.size,
                    }),
                );
            }
            SnapshotOutcome::NoChanges { previous_id } => self.record(
                "BACKUP_SKIPPED",
                EventSeverity::Info,
                json!({ "trigger": request.trigger, "previous_id": previous_id }),
            ),
        }
        Ok(outcome)
    }

    /// Host lifecycle hook. Automatic triggers inside the minimum interval
    /// are ignored (`Ok(None)`). A login also counts against safety holds
    /// and runs retention afterwards.
    pub fn on_lifecycle(&self, trigger: Trigger) -> Result<Option<SnapshotOutcome>> {
        if trigger == Trigger::Login {
            self.record_login()?;
        }

        if trigger.is_automatic() && self.within_min_interval() {
            info!(?trigger, "backup skipped, last one is recent");
            return Ok(None);
        }

        let outcome = self.create_snapshot(SnapshotRequest::new(trigger))?;

        if trigger == Trigger::Login {
            if let Err(e) = self.enforce_retention() {
                warn!("retention after login failed: {e}");
            }
        }
        Ok(Some(outcome))
    }

    fn within_min_interval(&self) -> bool {
        let interval = Duration::minutes(self.settings.min_interval_minutes as i64);
        self.index
            .lock()
            .latest_chain_head()
            .map(|p| Utc::now() - p.created_at < interval)
            .unwrap_or(false)
    }

    /// Delete a point (and with `cascade`, everything that depends on it).
    pub fn delete_point(&self, point_id: &str, cascade: bool) -> Result<Removal> {
        let _permit = self.lock.try_acquire(Operation::Delete)?;
        let protected = self.orchestrator.protected_points()?;

        let removal = {
            let mut index = self.index.lock();
            let chain = index
                .chain_of(point_id)
                .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))?;
            let in_use = chain
                .points
                .iter()
                .skip_while(|p| p.id != point_id)
                .any(|p| protected.contains(&p.id));
            if in_use {
                return Err(BackupError::PointInUse(point_id.to_string()));
            }
            let removal = index.remove(point_id, cascade)?;
            index.save(&self.store.catalog)?;
            removal
        };

        self.remove_archives(&removal);
        if let Some(warning) = removal.warning() {
            warn!("{warning}");
        }
        self.record(
            "POINT_DELETED",
            EventSeverity::Warn,
            json!({
                "point_id": removal.point.id,
                "dependents": removal.dependents.iter().map(|p| &p.id).collect::<Vec<_>>(),
            }),
        );
        Ok(removal)
    }

    pub fn verify_point(&self, point_id: &str, depth: VerifyDepth) -> Result<VerificationResult> {
        let point = self.point(point_id)?;
        let result = self.verifier.verify(&point, depth);
        if !result.ok {
            self.record(
                "VERIFY_FAILED",
                EventSeverity::Error,
                json!({ "point_id": point_id, "mismatches": result.mismatches.len() }),
            );
        }
        Ok(result)
    }

    pub fn prepare_restore(&self, point_id: &str) -> Result<RestoreState> {
        let _permit = self.lock.try_acquire(Operation::PrepareRestore)?;
        let prepared = {
            let index = self.index.lock();
            self.orchestrator.prepare(&index, point_id)
        };
        match prepared {
            Ok(state) => {
                self.record(
                    "RESTORE_PREPARED",
                    EventSeverity::Warn,
                    json!({ "target": state.target_point_id, "points": state.restore_set.len() }),
                );
                Ok(state)
            }
            Err(e) => {
                self.record(
                    "RESTORE_FAILED",
                    EventSeverity::Error,
                    json!({ "target": point_id, "stage": "prepare", "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub fn cancel_restore(&self) -> Result<RestoreState> {
        let _permit = self.lock.try_acquire(Operation::PrepareRestore)?;
        let state = self.orchestrator.cancel()?;
        self.record(
            "RESTORE_CANCELLED",
            EventSeverity::Info,
            json!({ "target": state.target_point_id }),
        );
        Ok(state)
    }

    pub fn restore_state(&self) -> Result<Option<RestoreState>> {
        self.orchestrator.state()
    }

    /// Apply or resume a pending restore. Call once at process start,
    /// before the live data store is opened.
    pub fn apply_pending_restore(&self) -> Result<ApplyOutcome> {
        let _permit = self.lock.try_acquire(Operation::ApplyRestore)?;
        let applied = {
            let mut index = self.index.lock();
            self.orchestrator.apply(&mut index, &self.engine)
        };
        match &applied {
            Ok(ApplyOutcome::Applied {
                target_point_id,
                safety_point_id,
                resumed,
            }) => self.record(
                "RESTORE_APPLIED",
                EventSeverity::Warn,
                json!({ "target": target_point_id, "safety": safety_point_id, "resumed": resumed }),
            ),
            Ok(ApplyOutcome::NothingPending) => {}
            Err(e) => self.record(
                "RESTORE_FAILED",
                EventSeverity::Error,
                json!({ "stage": "apply", "error": e.to_string() }),
            ),
        }
        applied
    }

    pub fn enforce_retention(&self) -> Result<RetentionReport> {
        let _permit = self.lock.try_acquire(Operation::Retention)?;
        let protected: HashSet<String> = self.orchestrator.protected_points()?;

        let report = {
            let mut index = self.index.lock();
            let report = self.retention.enforce(&mut index, Utc::now(), &protected)?;
            if !report.removed.is_empty() {
                index.save(&self.store.catalog)?;
            }
            report
        };

        for removal in &report.removed {
            self.remove_archives(removal);
        }
        self.record(
            "RETENTION_RUN",
            EventSeverity::Info,
            json!({ "removed": report.removed_points(), "kept_chains": report.kept_chains }),
        );
        Ok(report)
    }

    /// Count a successful login against outstanding safety holds.
    pub fn record_login(&self) -> Result<()> {
        let _permit = self.lock.try_acquire(Operation::RecordLogin)?;
        let mut index = self.index.lock();
        index.record_login();
        index.save(&self.store.catalog)
    }

    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        self.history.read_recent(limit)
    }

    fn remove_archives(&self, removal: &Removal) {
        for point in removal.all() {
            let path = self.store.archive_path(&point.archive.file_name);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "cannot remove archive: {e}");
                }
            }
        }
    }

    fn record(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        if let Err(e) = self.history.append(event_type, severity, data) {
            warn!(event_type, "cannot write backup history: {e}");
        }
    }
}

/// Archives that made it into `archives/` but never into the catalog, e.g.
/// when the process died between the rename and the catalog save.
fn remove_orphan_archives(store: &BackupLayout, index: &ChainIndex) {
    let known: HashSet<&str> = index.points().map(|p| p.archive.file_name.as_str()).collect();
    let Ok(entries) = fs::read_dir(&store.archives) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !known.contains(name.as_str()) {
            warn!(path = %entry.path().display(), "removing archive missing from catalog");
            let _ = fs::remove_file(entry.path());
        }
    }
}
