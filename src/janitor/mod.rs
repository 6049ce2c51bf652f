//! Snapshot directory janitor.
//!
//! Sweeps the destination root of one node for snapshot directories no
//! published volume references. Directories without a completion marker are
//! leftovers of interrupted copies and are removed once old enough;
//! committed but unreferenced directories are reported, and removed only
//! when asked. The sweep fails if anything it tried to remove remains.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::backup::{SnapshotStore, StoreError, StoredSnapshot};
use crate::cluster::{ClusterApi, ClusterError};
use crate::label::validate;
use crate::model::annotations;

mod types;

pub use types::{DEFAULT_MIN_AGE_SECS, JanitorConfig, SweepSummary};

/// Errors returned by the janitor.
#[derive(Debug, Error)]
pub enum JanitorError {
    /// Raised when the destination root cannot be read or cleaned.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when published volumes cannot be listed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// Raised when directories remain after the sweep removed them.
    #[error("snapshot directories remain after janitor sweep: {message}")]
    NotClean {
        /// Names of the remaining directories.
        message: String,
    },
}

/// Removes snapshot directories that no published volume references.
#[derive(Debug)]
pub struct Janitor<C> {
    cluster: Arc<C>,
    store: SnapshotStore,
    config: JanitorConfig,
}

impl<C: ClusterApi> Janitor<C> {
    /// Creates a janitor over `store`.
    #[must_use]
    pub const fn new(cluster: Arc<C>, store: SnapshotStore, config: JanitorConfig) -> Self {
        Self {
            cluster,
            store,
            config,
        }
    }

    /// Performs a sweep as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when listing or removal fails, or when
    /// directories selected for removal are still present afterwards.
    pub async fn sweep(&self, now: SystemTime) -> Result<SweepSummary, JanitorError> {
        let referenced = self.referenced_labels().await?;
        let mut summary = SweepSummary::default();
        let mut removed = BTreeSet::new();

        for snapshot in self.store.list()? {
            if referenced.contains(&snapshot.name) {
                summary.referenced += 1;
                continue;
            }
            let Ok(label) = validate(&snapshot.name) else {
                tracing::debug!(name = %snapshot.name, "skipping entry that is not a snapshot label");
                summary.skipped_foreign += 1;
                continue;
            };
            if !self.is_old_enough(&snapshot, now) {
                summary.skipped_recent += 1;
                continue;
            }
            if snapshot.committed && !self.config.delete_unreferenced {
                tracing::warn!(%label, "committed snapshot is not referenced by any volume");
                summary.kept_unreferenced.push(snapshot.name);
                continue;
            }
            self.store.remove(&label).await?;
            tracing::info!(%label, committed = snapshot.committed, "removed orphaned snapshot");
            if snapshot.committed {
                summary.removed_unreferenced += 1;
            } else {
                summary.removed_partial += 1;
            }
            removed.insert(snapshot.name);
        }

        let remaining = self
            .store
            .list()?
            .into_iter()
            .filter(|snapshot| removed.contains(&snapshot.name))
            .map(|snapshot| snapshot.name)
            .collect::<Vec<_>>();
        if !remaining.is_empty() {
            return Err(JanitorError::NotClean {
                message: remaining.join(", "),
            });
        }
        Ok(summary)
    }

    async fn referenced_labels(&self) -> Result<BTreeSet<String>, ClusterError> {
        let volumes = self.cluster.list_published_volumes().await?;
        Ok(volumes
            .iter()
            .filter_map(|volume| volume.annotation(annotations::SNAPSHOT))
            .map(str::to_owned)
            .collect())
    }

    fn is_old_enough(&self, snapshot: &StoredSnapshot, now: SystemTime) -> bool {
        snapshot
            .modified
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= self.config.min_age)
    }
}
