//! Manifest builder: enumerates the live data file and attachment tree.
//!
//! Every tracked file is hashed with BLAKE3 and keyed by its path relative to
//! the live root. The output is sorted by path so two scans of the same state
//! produce identical manifests. A file that cannot be read is reported as a
//! [`SkippedEntry`] and the scan carries on.

use crate::paths::LiveLayout;
use blake3::Hasher;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub hash: String, // BLAKE3 hex
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// Tracked content that exists but could not be read this time.
    #[default]
    Unreadable,
    /// Never backed up, e.g. symbolic links.
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub error: String,
    #[serde(default)]
    pub kind: SkipKind,
}

impl SkippedEntry {
    fn unreadable(path: String, error: impl Into<String>) -> Self {
        Self {
            path,
            error: error.into(),
            kind: SkipKind::Unreadable,
        }
    }

    /// True when `path` is this entry or lies below it (a skipped directory
    /// hides everything under it).
    pub fn covers(&self, path: &str) -> bool {
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    pub skipped: Vec<SkippedEntry>,
}

impl ScanReport {
    /// Whether `path` could not be looked at in this scan.
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skipped.iter().any(|s| s.covers(path))
    }

    /// Paths of `previous` that this scan could not read. A new full point
    /// built from this scan would not contain them.
    pub fn hidden_by_unreadable(&self, previous: &EffectiveManifest) -> Vec<String> {
        previous
            .keys()
            .filter(|p| {
                self.skipped
                    .iter()
                    .any(|s| s.kind == SkipKind::Unreadable && s.covers(p))
            })
            .cloned()
            .collect()
    }

    pub fn unreadable(&self) -> impl Iterator<Item = &SkippedEntry> {
        self.skipped.iter().filter(|s| s.kind == SkipKind::Unreadable)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Reconstructed state at some backup point: path → entry.
pub type EffectiveManifest = BTreeMap<String, ManifestEntry>;

/// Changes between a previous effective manifest and a fresh scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub changed: Vec<ManifestEntry>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len() + self.removed.len()
    }
}

/// Compare a scan against the state a point restores to. Paths that could
/// not be read this time, or that sit under a directory that could not be
/// read, are treated as unchanged, never as removed.
pub fn diff(previous: &EffectiveManifest, current: &ScanReport) -> ManifestDiff {
    let mut seen = BTreeSet::new();
    let mut changed = Vec::new();
    for entry in &current.entries {
        seen.insert(entry.path.as_str());
        match previous.get(&entry.path) {
            Some(prev) if prev.hash == entry.hash && prev.size == entry.size => {}
            _ => changed.push(entry.clone()),
        }
    }
    let removed = previous
        .keys()
        .filter(|p| !seen.contains(p.as_str()) && !current.is_skipped(p))
        .cloned()
        .collect();
    ManifestDiff { changed, removed }
}

pub struct ManifestBuilder {
    layout: LiveLayout,
}

impl ManifestBuilder {
    pub fn new(layout: LiveLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &LiveLayout {
        &self.layout
    }

    /// Scan the live state. Never fails: problems end up in `skipped`.
    pub fn build(&self) -> ScanReport {
        let (candidates, mut skipped) = self.collect_candidates();

        let hashed: Vec<Result<ManifestEntry, SkippedEntry>> = candidates
            .par_iter()
            .map(|(rel, abs)| match hash_file(abs) {
                Ok((hash, size)) => Ok(ManifestEntry {
                    path: rel.clone(),
                    size,
                    hash,
                }),
                Err(e) => Err(SkippedEntry::unreadable(rel.clone(), e.to_string())),
            })
            .collect();

        let mut entries = Vec::with_capacity(hashed.len());
        for item in hashed {
            match item {
                Ok(entry) => entries.push(entry),
                Err(skip) => skipped.push(skip),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        skipped.sort_by(|a, b| a.path.cmp(&b.path));

        if !skipped.is_empty() {
            warn!("{} entries skipped during manifest scan", skipped.len());
            for s in &skipped {
                warn!("  {} - {}", s.path, s.error);
            }
        }
        info!(files = entries.len(), "manifest scan complete");

        ScanReport {
            scanned_at: Utc::now(),
            entries,
            skipped,
        }
    }

    /// Walk the tracked items and collect (relative key, absolute path) pairs
    fn collect_candidates(&self) -> (Vec<(String, PathBuf)>, Vec<SkippedEntry>) {
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();
        let root = &self.layout.root;

        let data_file = self.layout.data_file_path();
        match fs::symlink_metadata(&data_file) {
            Ok(meta) if meta.is_file() => {
                candidates.push((self.layout.data_file.clone(), data_file));
            }
            Ok(_) => skipped.push(SkippedEntry::unreadable(
                self.layout.data_file.clone(),
                "data file is not a regular file",
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %data_file.display(), "data file does not exist yet");
            }
            Err(e) => skipped.push(SkippedEntry::unreadable(self.layout.data_file.clone(), e.to_string())),
        }

        let attachments = self.layout.attachments_path();
        if !attachments.exists() {
            debug!(path = %attachments.display(), "attachment directory does not exist yet");
            return (candidates, skipped);
        }

        for entry in WalkDir::new(&attachments).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| relative_key(root, p))
                        .unwrap_or_else(|| self.layout.attachments_dir.clone());
                    skipped.push(SkippedEntry::unreadable(path, e.to_string()));
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let Some(rel) = relative_key(root, entry.path()) else {
                continue;
            };
            if file_type.is_symlink() {
                skipped.push(SkippedEntry {
                    path: rel,
                    error: "symbolic links are not backed up".into(),
                    kind: SkipKind::Unsupported,
                });
                continue;
            }
            if file_type.is_file() {
                candidates.push((rel, entry.into_path()));
            }
        }

        (candidates, skipped)
    }
}

/// Relative manifest key for `path` under `root`, with `/` separators.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Hash a single file using BLAKE3
pub fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buffer[..n]);
    }
    Ok((hasher.finalize().to_hex().to_string(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(root: &Path) -> LiveLayout {
        LiveLayout::new(root, "casefile.db", "attachments")
    }

    #[test]
    fn scan_is_sorted_and_relative() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("casefile.db"), b"db").unwrap();
        fs::create_dir_all(dir.path().join("attachments/2024")).unwrap();
        fs::write(dir.path().join("attachments/2024/z.pdf"), b"zzz").unwrap();
        fs::write(dir.path().join("attachments/a.png"), b"a").unwrap();
        fs::write(dir.path().join("untracked.log"), b"ignored").unwrap();

        let report = ManifestBuilder::new(layout(dir.path())).build();
        let paths: Vec<&str> = report.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["attachments/2024/z.pdf", "attachments/a.png", "casefile.db"]);
        assert_eq!(report.entries[0].size, 3);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn empty_live_root_scans_clean() {
        let dir = tempdir().unwrap();
        let report = ManifestBuilder::new(layout(dir.path())).build();
        assert!(report.entries.is_empty());
        assert!(report.skipped.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_attachment_is_skipped_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("casefile.db"), b"db").unwrap();
        fs::create_dir_all(dir.path().join("attachments")).unwrap();
        let locked = dir.path().join("attachments/locked.pdf");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // root ignores permission bits; nothing to assert there
        if fs::File::open(&locked).is_ok() {
            return;
        }

        let report = ManifestBuilder::new(layout(dir.path())).build();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, "attachments/locked.pdf");
    }

    #[test]
    fn diff_keeps_skipped_paths() {
        let mut previous = EffectiveManifest::new();
        for (p, h) in [("a", "1"), ("b", "2"), ("c", "3")] {
            previous.insert(
                p.into(),
                ManifestEntry { path: p.into(), size: 1, hash: h.into() },
            );
        }
        let report = ScanReport {
            scanned_at: Utc::now(),
            entries: vec![
                ManifestEntry { path: "a".into(), size: 1, hash: "1".into() },
                ManifestEntry { path: "d".into(), size: 1, hash: "4".into() },
            ],
            skipped: vec![SkippedEntry::unreadable("b".into(), "denied")],
        };
        let d = diff(&previous, &report);
        assert_eq!(d.changed.len(), 1);
        assert_eq!(d.changed[0].path, "d");
        assert_eq!(d.removed, vec!["c".to_string()]);
    }

    #[test]
    fn diff_keeps_files_under_unreadable_directory() {
        let mut previous = EffectiveManifest::new();
        for (p, h) in [
            ("attachments/sub/x.pdf", "1"),
            ("attachments/sub/y.pdf", "2"),
            ("attachments/subway.png", "3"),
            ("casefile.db", "4"),
        ] {
            previous.insert(
                p.into(),
                ManifestEntry { path: p.into(), size: 1, hash: h.into() },
            );
        }
        let report = ScanReport {
            scanned_at: Utc::now(),
            entries: vec![ManifestEntry { path: "casefile.db".into(), size: 1, hash: "4".into() }],
            skipped: vec![SkippedEntry::unreadable("attachments/sub".into(), "Permission denied")],
        };
        let d = diff(&previous, &report);
        assert!(d.changed.is_empty());
        // a sibling that merely shares the prefix is really gone
        assert_eq!(d.removed, vec!["attachments/subway.png".to_string()]);
        assert_eq!(
            report.hidden_by_unreadable(&previous),
            vec!["attachments/sub/x.pdf".to_string(), "attachments/sub/y.pdf".to_string()]
        );
    }

    #[test]
    fn unsupported_entries_hide_nothing() {
        let mut previous = EffectiveManifest::new();
        previous.insert(
            "attachments/link".into(),
            ManifestEntry { path: "attachments/link".into(), size: 1, hash: "1".into() },
        );
        let report = ScanReport {
            scanned_at: Utc::now(),
            entries: vec![],
            skipped: vec![SkippedEntry {
                path: "attachments/link".into(),
                error: "symbolic links are not backed up".into(),
                kind: SkipKind::Unsupported,
            }],
        };
        assert!(report.hidden_by_unreadable(&previous).is_empty());
        assert_eq!(report.unreadable().count(), 0);
    }
}
