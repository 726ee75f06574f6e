//! Chain index: the catalog of every backup point.
//!
//! Points are grouped by `chain_id` into ordered lists (full point first,
//! then incrementals by `created_at`). Every dependency query walks one chain
//! only. The catalog is persisted as JSON next to the archives, independent
//! of the live data store, and replaced atomically on every save.

use crate::error::{BackupError, Result};
use crate::manifest::EffectiveManifest;
use crate::paths::write_atomic;
use crate::point::{BackupPoint, PointKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    updated_at: DateTime<Utc>,
    points: Vec<BackupPoint>,
    #[serde(default)]
    safety_holds: BTreeMap<String, SafetyHold>,
}

/// Tracks how many logins a pre-restore point has survived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyHold {
    pub restored_at: DateTime<Utc>,
    pub logins_seen: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Chain {
    pub chain_id: String,
    /// Creation order; `points[0]` is the full (or pre-restore) point.
    pub points: Vec<BackupPoint>,
}

impl Chain {
    pub fn head(&self) -> &BackupPoint {
        &self.points[0]
    }

    pub fn latest(&self) -> &BackupPoint {
        &self.points[self.points.len() - 1]
    }

    pub fn is_safety(&self) -> bool {
        self.head().kind == PointKind::PreRestore
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.head().created_at
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn position(&self, point_id: &str) -> Option<usize> {
        self.points.iter().position(|p| p.id == point_id)
    }
}

/// What a snapshot needs to know about the point it builds on.
#[derive(Debug, Clone)]
pub struct SnapshotBase {
    pub previous: BackupPoint,
    pub effective: EffectiveManifest,
    pub chain_started_at: DateTime<Utc>,
    pub chain_len: usize,
}

/// Outcome of a removal: dependents (oldest first) followed by the point
/// that was asked for.
#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    pub point: BackupPoint,
    pub dependents: Vec<BackupPoint>,
}

impl Removal {
    /// Every removed point in removal order.
    pub fn all(&self) -> impl Iterator<Item = &BackupPoint> {
        self.dependents.iter().chain(std::iter::once(&self.point))
    }

    pub fn warning(&self) -> Option<String> {
        if self.dependents.is_empty() {
            return None;
        }
        let names: Vec<&str> = self.dependents.iter().map(|p| p.display_name.as_str()).collect();
        Some(format!(
            "also removed {} dependent backup(s): {}",
            self.dependents.len(),
            names.join("; ")
        ))
    }
}

#[derive(Debug, Default)]
pub struct ChainIndex {
    chains: HashMap<String, Chain>,
    chain_of_point: HashMap<String, String>,
    safety_holds: BTreeMap<String, SafetyHold>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the catalog, or start empty if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no catalog yet");
            return Ok(Self::new());
        }
        let json = fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&json)?;
        if file.version != CATALOG_VERSION {
            return Err(BackupError::Catalog(format!(
                "unsupported catalog version {}",
                file.version
            )));
        }

        let mut points = file.points;
        points.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut index = Self::new();
        for point in points {
            index.insert(point)?;
        }
        index.safety_holds = file
            .safety_holds
            .into_iter()
            .filter(|(id, _)| index.chain_of_point.contains_key(id))
            .collect();
        debug!(points = index.len(), "catalog loaded from {}", path.display());
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut points: Vec<BackupPoint> = self.points().cloned().collect();
        points.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let file = CatalogFile {
            version: CATALOG_VERSION,
            updated_at: Utc::now(),
            points,
            safety_holds: self.safety_holds.clone(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)
    }

    /// Catalogue a verified point, enforcing the chain invariants.
    pub fn insert(&mut self, point: BackupPoint) -> Result<()> {
        if self.chain_of_point.contains_key(&point.id) {
            return Err(BackupError::Catalog(format!("duplicate point id {}", point.id)));
        }
        match point.kind {
            PointKind::Full | PointKind::PreRestore => {
                if self.chains.contains_key(&point.chain_id) {
                    return Err(BackupError::Catalog(format!(
                        "chain {} already has a base point",
                        point.chain_id
                    )));
                }
                if point.parent_id.is_some() {
                    return Err(BackupError::Catalog(format!(
                        "{} point {} cannot have a parent",
                        point.kind, point.id
                    )));
                }
                self.chain_of_point.insert(point.id.clone(), point.chain_id.clone());
                self.chains.insert(
                    point.chain_id.clone(),
                    Chain {
                        chain_id: point.chain_id.clone(),
                        points: vec![point],
                    },
                );
            }
            PointKind::Incremental => {
                let chain = self.chains.get_mut(&point.chain_id).ok_or_else(|| {
                    BackupError::Catalog(format!(
                        "incremental {} references unknown chain {}",
                        point.id, point.chain_id
                    ))
                })?;
                if chain.is_safety() {
                    return Err(BackupError::Catalog(format!(
                        "incremental {} cannot extend a pre-restore chain",
                        point.id
                    )));
                }
                let latest = chain.latest();
                if point.parent_id.as_deref() != Some(latest.id.as_str()) {
                    return Err(BackupError::Catalog(format!(
                        "incremental {} must build on {}, the newest point of its chain",
                        point.id, latest.id
                    )));
                }
                if point.created_at <= latest.created_at {
                    return Err(BackupError::Catalog(format!(
                        "incremental {} is not newer than its parent",
                        point.id
                    )));
                }
                self.chain_of_point.insert(point.id.clone(), point.chain_id.clone());
                chain.points.push(point);
            }
        }
        Ok(())
    }

    pub fn get(&self, point_id: &str) -> Option<&BackupPoint> {
        let chain = self.chain_of(point_id)?;
        chain.position(point_id).map(|i| &chain.points[i])
    }

    pub fn chain(&self, chain_id: &str) -> Option<&Chain> {
        self.chains.get(chain_id)
    }

    pub fn chain_of(&self, point_id: &str) -> Option<&Chain> {
        let chain_id = self.chain_of_point.get(point_id)?;
        self.chains.get(chain_id)
    }

    pub fn points(&self) -> impl Iterator<Item = &BackupPoint> {
        self.chains.values().flat_map(|c| c.points.iter())
    }

    pub fn len(&self) -> usize {
        self.chain_of_point.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain_of_point.is_empty()
    }

    fn locate(&self, point_id: &str) -> Result<(&Chain, usize)> {
        let chain = self
            .chain_of(point_id)
            .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))?;
        let pos = chain
            .position(point_id)
            .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))?;
        Ok((chain, pos))
    }

    /// Points later in the same chain, which need this one to restore.
    pub fn dependents_of(&self, point_id: &str) -> Result<usize> {
        let (chain, pos) = self.locate(point_id)?;
        Ok(chain.len() - pos - 1)
    }

    /// Full point plus every incremental up to and including `point_id`, in
    /// the order they must be applied.
    pub fn restore_set(&self, point_id: &str) -> Result<Vec<BackupPoint>> {
        let (chain, pos) = self.locate(point_id)?;
        Ok(chain.points[..=pos].to_vec())
    }

    /// The state `point_id` restores to: each point's entries overlaid on its
    /// ancestors', tombstones applied.
    pub fn effective_manifest(&self, point_id: &str) -> Result<EffectiveManifest> {
        let (chain, pos) = self.locate(point_id)?;
        Ok(overlay(&chain.points[..=pos]))
    }

    /// Newest chain first by full point time; points inside a chain oldest
    /// first.
    pub fn chains_newest_first(&self) -> Vec<&Chain> {
        let mut chains: Vec<&Chain> = self.chains.values().collect();
        chains.sort_by(|a, b| {
            b.started_at()
                .cmp(&a.started_at())
                .then_with(|| b.chain_id.cmp(&a.chain_id))
        });
        chains
    }

    /// Newest point of the newest regular (non pre-restore) chain.
    pub fn latest_chain_head(&self) -> Option<&BackupPoint> {
        self.chains_newest_first()
            .into_iter()
            .find(|c| !c.is_safety())
            .map(|c| c.latest())
    }

    pub fn snapshot_base(&self, point_id: &str) -> Result<SnapshotBase> {
        let (chain, pos) = self.locate(point_id)?;
        Ok(SnapshotBase {
            previous: chain.points[pos].clone(),
            effective: overlay(&chain.points[..=pos]),
            chain_started_at: chain.started_at(),
            chain_len: chain.len(),
        })
    }

    /// Remove a point. With dependents and without `cascade` this fails with
    /// the dependent count; with `cascade` the dependents go first, oldest
    /// first.
    pub fn remove(&mut self, point_id: &str, cascade: bool) -> Result<Removal> {
        let (chain, pos) = self.locate(point_id)?;
        let dependents = chain.len() - pos - 1;
        if dependents > 0 && !cascade {
            return Err(BackupError::DependencyViolation {
                point_id: point_id.to_string(),
                dependents,
            });
        }
        let chain_id = chain.chain_id.clone();

        let chain = self
            .chains
            .get_mut(&chain_id)
            .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))?;
        let removed_tail = chain.points.split_off(pos);
        if chain.points.is_empty() {
            self.chains.remove(&chain_id);
        }

        let mut removed_tail = removed_tail.into_iter();
        let point = removed_tail
            .next()
            .ok_or_else(|| BackupError::PointNotFound(point_id.to_string()))?;
        let dependents: Vec<BackupPoint> = removed_tail.collect();
        for p in dependents.iter().chain(std::iter::once(&point)) {
            self.chain_of_point.remove(&p.id);
            self.safety_holds.remove(&p.id);
        }

        info!(
            point = %point.id,
            dependents = dependents.len(),
            "removed backup point from catalog"
        );
        Ok(Removal { point, dependents })
    }

    pub fn add_safety_hold(&mut self, point_id: &str, restored_at: DateTime<Utc>) {
        self.safety_holds.insert(
            point_id.to_string(),
            SafetyHold {
                restored_at,
                logins_seen: 0,
            },
        );
    }

    pub fn safety_hold(&self, point_id: &str) -> Option<SafetyHold> {
        self.safety_holds.get(point_id).copied()
    }

    /// Count a successful login against every outstanding safety hold.
    pub fn record_login(&mut self) {
        for hold in self.safety_holds.values_mut() {
            hold.logins_seen = hold.logins_seen.saturating_add(1);
        }
    }
}

fn overlay(points: &[BackupPoint]) -> EffectiveManifest {
    let mut state = EffectiveManifest::new();
    for point in points {
        for entry in &point.manifest {
            state.insert(entry.path.clone(), entry.clone());
        }
        for path in &point.tombstones {
            state.remove(path);
        }
    }
    state
}
