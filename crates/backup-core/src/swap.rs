//! Rename-based swap of a staged tree into the live root.
//!
//! Every step is a single `rename(2)` between directories on the same
//! filesystem. The set of remaining steps is derived from what exists on
//! disk, so after a crash [`TreeSwap::pending_steps`] picks up exactly where
//! the previous process stopped and running them finishes the swap.

use crate::error::{BackupError, Result};
use crate::paths::{fsync_dir, LiveLayout};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A tracked top-level item and whether the restored state contains it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapItem {
    pub name: String,
    pub in_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapStep {
    /// Move the live item into the back-out directory.
    BackOut(String),
    /// Move the staged item into the live root.
    Promote(String),
}

#[derive(Debug, Clone)]
pub struct TreeSwap {
    live_root: PathBuf,
    staged_root: PathBuf,
    backout_root: PathBuf,
    items: Vec<SwapItem>,
}

impl TreeSwap {
    pub fn new(live: &LiveLayout, items: Vec<SwapItem>) -> Self {
        let work = live.restore_work_dir();
        Self {
            live_root: live.root.clone(),
            staged_root: work.join("staged"),
            backout_root: work.join("previous"),
            items,
        }
    }

    pub fn staged_root(&self) -> &Path {
        &self.staged_root
    }

    pub fn backout_root(&self) -> &Path {
        &self.backout_root
    }

    /// Steps still needed to reach the post-swap state.
    pub fn pending_steps(&self) -> Vec<SwapStep> {
        let mut steps = Vec::new();
        for item in &self.items {
            let live = self.live_root.join(&item.name);
            let staged = self.staged_root.join(&item.name);
            let staged_ready = item.in_target && exists(&staged);
            let needs_backout = exists(&live) && (staged_ready || !item.in_target);
            if needs_backout {
                steps.push(SwapStep::BackOut(item.name.clone()));
            }
            if staged_ready {
                steps.push(SwapStep::Promote(item.name.clone()));
            }
        }
        steps
    }

    pub fn run_step(&self, step: &SwapStep) -> Result<()> {
        match step {
            SwapStep::BackOut(name) => {
                fs::create_dir_all(&self.backout_root)?;
                let dest = self.backout_root.join(name);
                if exists(&dest) {
                    // leftover from an older swap; the live item is authoritative
                    warn!(path = %dest.display(), "replacing stale back-out copy");
                    remove_any(&dest)?;
                }
                rename_synced(&self.live_root.join(name), &dest)
            }
            SwapStep::Promote(name) => {
                rename_synced(&self.staged_root.join(name), &self.live_root.join(name))
            }
        }
    }

    /// Run the remaining steps. On error the caller decides whether to
    /// [`revert`](Self::revert) or leave the state for the next start.
    pub fn run(&self) -> Result<usize> {
        let steps = self.pending_steps();
        for step in &steps {
            self.run_step(step)?;
        }
        info!(steps = steps.len(), live = %self.live_root.display(), "staged tree swapped into place");
        Ok(steps.len())
    }

    /// Put the back-out copy back, returning promoted items to staging.
    pub fn revert(&self) -> Result<()> {
        for item in self.items.iter().rev() {
            let live = self.live_root.join(&item.name);
            let staged = self.staged_root.join(&item.name);
            let backed_out = self.backout_root.join(&item.name);
            if !exists(&backed_out) {
                continue;
            }
            if exists(&live) {
                if item.in_target && !exists(&staged) {
                    fs::create_dir_all(&self.staged_root)?;
                    rename_synced(&live, &staged)?;
                } else {
                    return Err(BackupError::RestoreFailed(format!(
                        "cannot revert {}: live and back-out copies both exist",
                        item.name
                    )));
                }
            }
            rename_synced(&backed_out, &live)?;
        }
        warn!(live = %self.live_root.display(), "swap reverted to previous live state");
        Ok(())
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn rename_synced(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    if let Some(parent) = from.parent() {
        fsync_dir(parent)?;
    }
    if let Some(parent) = to.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}
