//! Integrity verification for archives and reconstructed trees.

use crate::archive::{read_archive, sha256_file, ArchiveContents};
use crate::error::{BackupError, Result};
use crate::manifest::{hash_file, relative_key, EffectiveManifest};
use crate::paths::BackupLayout;
use crate::point::BackupPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{error, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyDepth {
    /// Archive checksum only.
    Checksum,
    /// Checksum plus a rehash of every member against the manifest.
    Deep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub subject: String,
    pub depth: VerifyDepth,
    pub verified_at: DateTime<Utc>,
    pub ok: bool,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationResult {
    fn new(subject: impl Into<String>, depth: VerifyDepth, mismatches: Vec<Mismatch>) -> Self {
        Self {
            subject: subject.into(),
            depth,
            verified_at: Utc::now(),
            ok: mismatches.is_empty(),
            mismatches,
        }
    }

    /// Turn a failed result into [`BackupError::Integrity`].
    pub fn into_result(self) -> Result<Self> {
        if self.ok {
            return Ok(self);
        }
        let detail = self
            .mismatches
            .iter()
            .take(5)
            .map(|m| format!("{} (expected {}, found {})", m.path, m.expected, m.actual))
            .collect::<Vec<_>>()
            .join("; ");
        Err(BackupError::integrity(
            self.subject,
            format!("{} mismatch(es): {}", self.mismatches.len(), detail),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    store: BackupLayout,
}

impl IntegrityVerifier {
    pub fn new(store: BackupLayout) -> Self {
        Self { store }
    }

    /// Verify a catalogued point's archive.
    pub fn verify(&self, point: &BackupPoint, depth: VerifyDepth) -> VerificationResult {
        let path = self.store.archive_path(&point.archive.file_name);
        self.verify_archive_at(&path, point, depth)
    }

    /// Verify an archive that may not be in its final location yet.
    pub fn verify_archive_at(&self, archive: &Path, point: &BackupPoint, depth: VerifyDepth) -> VerificationResult {
        let subject = format!("backup {}", point.id);
        let mut mismatches = Vec::new();

        match sha256_file(archive) {
            Ok((sha, size)) => {
                if sha != point.archive.sha256 {
                    mismatches.push(Mismatch {
                        path: point.archive.file_name.clone(),
                        expected: point.archive.sha256.clone(),
                        actual: sha,
                    });
                } else if size != point.archive.size {
                    mismatches.push(Mismatch {
                        path: point.archive.file_name.clone(),
                        expected: format!("{} bytes", point.archive.size),
                        actual: format!("{size} bytes"),
                    });
                }
            }
            Err(e) => mismatches.push(Mismatch {
                path: point.archive.file_name.clone(),
                expected: "readable archive".into(),
                actual: e.to_string(),
            }),
        }

        if depth == VerifyDepth::Deep && mismatches.is_empty() {
            match read_archive(archive) {
                Ok(contents) => mismatches.extend(compare_contents(point, &contents)),
                Err(e) => mismatches.push(Mismatch {
                    path: point.archive.file_name.clone(),
                    expected: "readable archive".into(),
                    actual: e.to_string(),
                }),
            }
        }

        let result = VerificationResult::new(subject, depth, mismatches);
        log_result(&result);
        result
    }

    /// Compare a directory tree against the state it should hold. Only the
    /// tracked `items` under `root` are considered.
    pub fn verify_tree(root: &Path, items: &[&str], expected: &EffectiveManifest) -> VerificationResult {
        let mut mismatches = Vec::new();
        let mut seen = BTreeSet::new();

        for item in items {
            let start = root.join(item);
            if !start.exists() {
                continue;
            }
            for entry in WalkDir::new(&start).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        mismatches.push(Mismatch {
                            path: item.to_string(),
                            expected: "readable tree".into(),
                            actual: e.to_string(),
                        });
                        continue;
                    }
                };
                if entry.file_type().is_dir() {
                    continue;
                }
                let Some(rel) = relative_key(root, entry.path()) else {
                    continue;
                };
                match (expected.get(&rel), hash_file(entry.path())) {
                    (Some(want), Ok((hash, size))) => {
                        if want.hash != hash || want.size != size {
                            mismatches.push(Mismatch {
                                path: rel.clone(),
                                expected: want.hash.clone(),
                                actual: hash,
                            });
                        }
                    }
                    (Some(want), Err(e)) => mismatches.push(Mismatch {
                        path: rel.clone(),
                        expected: want.hash.clone(),
                        actual: e.to_string(),
                    }),
                    (None, _) => mismatches.push(Mismatch {
                        path: rel.clone(),
                        expected: "absent".into(),
                        actual: "present".into(),
                    }),
                }
                seen.insert(rel);
            }
        }

        for (path, want) in expected {
            if !seen.contains(path) {
                mismatches.push(Mismatch {
                    path: path.clone(),
                    expected: want.hash.clone(),
                    actual: "missing".into(),
                });
            }
        }

        let result = VerificationResult::new(root.display().to_string(), VerifyDepth::Deep, mismatches);
        log_result(&result);
        result
    }
}

fn compare_contents(point: &BackupPoint, contents: &ArchiveContents) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();

    match &contents.header {
        Some(header) => {
            if header.point_id != point.id
                || header.chain_id != point.chain_id
                || header.entries != point.manifest
                || header.tombstones != point.tombstones
            {
                mismatches.push(Mismatch {
                    path: "manifest.json".into(),
                    expected: format!("manifest of {}", point.id),
                    actual: format!("manifest of {}", header.point_id),
                });
            }
        }
        None => mismatches.push(Mismatch {
            path: "manifest.json".into(),
            expected: "embedded manifest".into(),
            actual: "missing".into(),
        }),
    }

    for entry in &point.manifest {
        match contents.files.get(&entry.path) {
            Some((hash, size)) if *hash == entry.hash && *size == entry.size => {}
            Some((hash, _)) => mismatches.push(Mismatch {
                path: entry.path.clone(),
                expected: entry.hash.clone(),
                actual: hash.clone(),
            }),
            None => mismatches.push(Mismatch {
                path: entry.path.clone(),
                expected: entry.hash.clone(),
                actual: "missing".into(),
            }),
        }
    }
    for path in contents.files.keys() {
        if !point.manifest.iter().any(|e| &e.path == path) {
            mismatches.push(Mismatch {
                path: path.clone(),
                expected: "absent".into(),
                actual: "present".into(),
            });
        }
    }
    mismatches
}

fn log_result(result: &VerificationResult) {
    if result.ok {
        info!(subject = %result.subject, depth = ?result.depth, "integrity check passed");
    } else {
        error!(
            subject = %result.subject,
            mismatches = result.mismatches.len(),
            "INTEGRITY FAILURE"
        );
    }
}
