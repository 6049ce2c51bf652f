//! Cleanup of published volumes.
//!
//! Deletion of a published volume runs [`CleanupController::finalize`]
//! before the finalizer is released. A volume reported `Failed` is deleted
//! so it takes the same path. Everything cleanup needs is read from the
//! volume's own annotations; nothing is removed unless the snapshot label
//! validates and the recorded destination is exactly its directory under
//! the destination root.

use std::sync::Arc;

use thiserror::Error;

use crate::backup::{SnapshotStore, StoreError};
use crate::cluster::{ClusterApi, ClusterError};
use crate::label::{LabelError, SnapshotLabel, validate};
use crate::model::{ReclaimPolicy, VolumeRecord, annotations};

/// Errors raised while cleaning up a volume.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// Raised when a required annotation is absent.
    #[error("volume {volume} has no {key} annotation")]
    MissingAnnotation {
        /// Volume name.
        volume: String,
        /// Annotation key.
        key: &'static str,
    },
    /// Raised when the recorded snapshot label is unsafe.
    #[error("volume {volume} records an invalid snapshot label: {source}")]
    InvalidLabel {
        /// Volume name.
        volume: String,
        /// Validation failure.
        #[source]
        source: LabelError,
    },
    /// Raised when the recorded destination is not the label's directory.
    #[error("volume {volume} records destination {found}, expected {expected}")]
    PathMismatch {
        /// Volume name.
        volume: String,
        /// Directory derived from the label.
        expected: String,
        /// Directory recorded on the volume.
        found: String,
    },
    /// Raised when removal fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Wrapper for cluster API failures.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// What cleanup did for one volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CleanupOutcome {
    /// The snapshot directory was removed (or was already gone).
    Removed {
        /// Snapshot label.
        label: SnapshotLabel,
    },
    /// The reclaim policy keeps the directory.
    Retained {
        /// Snapshot label.
        label: SnapshotLabel,
    },
    /// The directory lives on another node; nothing was touched.
    NotOnThisNode {
        /// Node recorded on the volume.
        node: String,
    },
    /// Cleanup failed; the failure was logged.
    Failed {
        /// Failure description.
        message: String,
    },
}

/// Reverses publication for volumes on this node.
#[derive(Debug)]
pub struct CleanupController<C> {
    cluster: Arc<C>,
    store: SnapshotStore,
    node_name: String,
}

impl<C: ClusterApi> CleanupController<C> {
    /// Creates a controller for the instance on `node_name`.
    #[must_use]
    pub const fn new(cluster: Arc<C>, store: SnapshotStore, node_name: String) -> Self {
        Self {
            cluster,
            store,
            node_name,
        }
    }

    /// Returns `true` when the volume's snapshot lives on this node.
    #[must_use]
    pub fn owns(&self, volume: &VolumeRecord) -> bool {
        volume.annotation(annotations::NODE) == Some(self.node_name.as_str())
    }

    /// Deletes a volume reporting the `Failed` phase so its deletion runs
    /// cleanup. Returns whether a delete was issued.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the delete call fails.
    pub async fn handle_failed(&self, volume: &VolumeRecord) -> Result<bool, ClusterError> {
        if !volume.is_failed() || volume.deleting {
            return Ok(false);
        }
        tracing::warn!(volume = %volume.name, "volume failed, deleting it to run cleanup");
        self.cluster.delete_volume(&volume.name).await?;
        Ok(true)
    }

    /// Runs cleanup for a volume being deleted. Never fails: errors are
    /// logged and reported as [`CleanupOutcome::Failed`] so the finalizer
    /// can be released regardless.
    pub async fn finalize(&self, volume: &VolumeRecord) -> CleanupOutcome {
        tracing::info!(volume = %volume.name, "cleanup in flight");
        match self.cleanup(volume).await {
            Ok(outcome) => {
                tracing::info!(volume = %volume.name, ?outcome, "cleaned");
                outcome
            }
            Err(err) => {
                tracing::error!(volume = %volume.name, error = %err, "cleanup failed");
                CleanupOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Removes or keeps the snapshot directory per the volume's reclaim
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError`] when annotations are missing or unsafe, or
    /// when removal fails.
    pub async fn cleanup(&self, volume: &VolumeRecord) -> Result<CleanupOutcome, CleanupError> {
        let node = required_annotation(volume, annotations::NODE)?;
        if node != self.node_name {
            return Ok(CleanupOutcome::NotOnThisNode {
                node: node.to_owned(),
            });
        }
        let raw_label = required_annotation(volume, annotations::SNAPSHOT)?;
        let label = validate(raw_label).map_err(|source| CleanupError::InvalidLabel {
            volume: volume.name.clone(),
            source,
        })?;

        match ReclaimPolicy::from_policy(volume.reclaim_policy.as_deref()) {
            ReclaimPolicy::Retain => Ok(CleanupOutcome::Retained { label }),
            ReclaimPolicy::Delete => {
                let recorded = required_annotation(volume, annotations::DESTINATION)?;
                let expected = self.store.host_path(&label);
                if recorded != expected.as_str() {
                    return Err(CleanupError::PathMismatch {
                        volume: volume.name.clone(),
                        expected: expected.to_string(),
                        found: recorded.to_owned(),
                    });
                }
                let existed = self.store.remove(&label).await?;
                if !existed {
                    tracing::debug!(%label, "snapshot directory already absent");
                }
                Ok(CleanupOutcome::Removed { label })
            }
        }
    }
}

fn required_annotation<'a>(
    volume: &'a VolumeRecord,
    key: &'static str,
) -> Result<&'a str, CleanupError> {
    volume
        .annotation(key)
        .ok_or_else(|| CleanupError::MissingAnnotation {
            volume: volume.name.clone(),
            key,
        })
}
