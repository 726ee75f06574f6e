//! Process-wide exclusion for backup and restore work.
//!
//! Only one snapshot, retention run, deletion or restore step may run at a
//! time. Contending callers get [`BackupError::Busy`] immediately instead of
//! queueing behind a slow operation.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Snapshot,
    Retention,
    Delete,
    PrepareRestore,
    ApplyRestore,
    RecordLogin,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Snapshot => "backup",
            Operation::Retention => "retention cleanup",
            Operation::Delete => "backup deletion",
            Operation::PrepareRestore => "restore preparation",
            Operation::ApplyRestore => "restore",
            Operation::RecordLogin => "login bookkeeping",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningOperation {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
}

/// Shared guard flag. Clone the `Arc` to hand the same lock to several
/// components, or to a test that wants to hold it.
#[derive(Debug, Default)]
pub struct OperationLock {
    running: Mutex<Option<RunningOperation>>,
}

impl OperationLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock for `operation` or fail fast with the operation holding it.
    pub fn try_acquire(self: &Arc<Self>, operation: Operation) -> Result<OperationPermit> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            return Err(BackupError::Busy {
                running: current.operation,
            });
        }
        *running = Some(RunningOperation {
            operation,
            started_at: Utc::now(),
        });
        debug!(%operation, "operation lock acquired");
        Ok(OperationPermit {
            lock: Arc::clone(self),
            operation,
        })
    }

    pub fn current(&self) -> Option<RunningOperation> {
        *self.running.lock()
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct OperationPermit {
    lock: Arc<OperationLock>,
    operation: Operation,
}

impl OperationPermit {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        *self.lock.running.lock() = None;
        debug!(operation = %self.operation, "operation lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_fails_fast() {
        let lock = OperationLock::new();
        let permit = lock.try_acquire(Operation::Snapshot).unwrap();
        let err = lock.try_acquire(Operation::ApplyRestore).unwrap_err();
        match err {
            BackupError::Busy { running } => assert_eq!(running, Operation::Snapshot),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(lock.current().unwrap().operation, Operation::Snapshot);
        drop(permit);
        assert!(lock.current().is_none());
        lock.try_acquire(Operation::Retention).unwrap();
    }

    #[test]
    fn busy_message_names_running_operation() {
        let lock = OperationLock::new();
        let _permit = lock.try_acquire(Operation::Retention).unwrap();
        let msg = lock.try_acquire(Operation::Snapshot).unwrap_err().to_string();
        assert_eq!(msg, "retention cleanup already in progress; try again when it finishes");
    }
}
