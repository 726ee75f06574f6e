//! Append-only history of backup and restore events.
//!
//! One JSON object per line. Each entry carries the SHA-256 of its own body
//! and of the previous entry, so truncation or edits show up in
//! [`HistoryLog::verify_chain`]. The file rotates by size, keeping
//! `MAX_ROTATIONS` old generations.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct HistoryLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl HistoryLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for entry in Self::read_entries(path)? {
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn compute_hash(body: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn body(entry: &HistoryEntry) -> serde_json::Value {
        serde_json::json!({
            "seq": entry.seq,
            "timestamp": entry.timestamp,
            "event_type": entry.event_type,
            "severity": entry.severity,
            "data": entry.data,
            "prev_hash": entry.prev_hash,
        })
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: EventSeverity,
        data: serde_json::Value,
    ) -> Result<HistoryEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let mut entry = HistoryEntry {
            seq: state.last_seq + 1,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            severity,
            data,
            prev_hash: state.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = Self::compute_hash(&Self::body(&entry));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        state.last_seq = entry.seq;
        state.last_hash = entry.hash.clone();
        Ok(entry)
    }

    fn rotate_if_needed(&self, state: &mut LogState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i)?;
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1)?)?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1)?)?;
        // new file starts a new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Most recent entries of the current file, newest first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let _state = self.inner.lock();
        let mut entries = Self::read_entries(&self.path)?;
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Re-derive every hash of the current file. Returns the first broken
    /// sequence number, if any.
    pub fn verify_chain(&self) -> Result<Option<u64>> {
        let _state = self.inner.lock();
        let mut prev = CHAIN_START.to_string();
        for entry in Self::read_entries(&self.path)? {
            if entry.prev_hash != prev || Self::compute_hash(&Self::body(&entry)) != entry.hash {
                return Ok(Some(entry.seq));
            }
            prev = entry.hash;
        }
        Ok(None)
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        let filename = self
            .path
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("bad history path {}", self.path.display())))?
            .to_string_lossy()
            .to_string();
        Ok(self.path.with_file_name(format!("{filename}.{index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_and_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.log");
        let log = HistoryLog::new(&path, 512).unwrap();
        for i in 0..50 {
            let e = log
                .append("BACKUP_CREATED", EventSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
            assert_eq!(e.seq as usize, i + 1);
        }
        assert!(dir.path().join("history.log.1").exists());
        assert_eq!(log.verify_chain().unwrap(), None);

        // sequence survives reopening
        let reopened = HistoryLog::new(&path, 512).unwrap();
        let next = reopened
            .append("BACKUP_SKIPPED", EventSeverity::Info, serde_json::json!({}))
            .unwrap();
        assert_eq!(next.seq, 51);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.log");
        let log = HistoryLog::new(&path, 1 << 20).unwrap();
        log.append("POINT_DELETED", EventSeverity::Warn, serde_json::json!({"id": "a"}))
            .unwrap();
        log.append("POINT_DELETED", EventSeverity::Warn, serde_json::json!({"id": "b"}))
            .unwrap();

        let text = fs::read_to_string(&path).unwrap().replace("\"b\"", "\"c\"");
        fs::write(&path, text).unwrap();
        assert_eq!(log.verify_chain().unwrap(), Some(2));

        let recent = log.read_recent(Some(1)).unwrap();
        assert_eq!(recent[0].seq, 2);
    }
}
