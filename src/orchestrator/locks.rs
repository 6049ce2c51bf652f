//! Per-source mutual exclusion and the in-flight label set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::label::SnapshotLabel;

/// One async lock per source cluster identity.
///
/// Requests for different claims that share a source serialise here, so a
/// source never has two backups open at once.
#[derive(Debug, Default)]
pub struct SourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SourceLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `source`.
    pub async fn acquire(&self, source: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|key, lock| key == source || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(source.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Returns `true` when `source` is currently held.
    #[must_use]
    pub fn is_held(&self, source: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

/// Labels with a snapshot attempt currently running.
#[derive(Debug, Default)]
pub struct InFlightLabels {
    labels: Arc<Mutex<HashSet<SnapshotLabel>>>,
}

impl InFlightLabels {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `label` as running; `None` when it already is.
    #[must_use]
    pub fn claim(&self, label: &SnapshotLabel) -> Option<InFlightGuard> {
        let inserted = self
            .labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.clone());
        inserted.then(|| InFlightGuard {
            labels: Arc::clone(&self.labels),
            label: label.clone(),
        })
    }

    /// Returns `true` when `label` is running.
    #[must_use]
    pub fn contains(&self, label: &SnapshotLabel) -> bool {
        self.labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(label)
    }
}

/// Releases an in-flight label when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    labels: Arc<Mutex<HashSet<SnapshotLabel>>>,
    label: SnapshotLabel,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.label);
    }
}
