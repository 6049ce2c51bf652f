//! Snapshot orchestration.
//!
//! Sequences one snapshot for a resolved source: claims the label, waits for
//! the source's lock, reuses or discards what is already on disk, opens a
//! session and hands it to the [`BackupDriver`].

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::backup::{
    BackupDriver, BackupError, CommittedSnapshot, DatabaseConnector, SnapshotStatus,
    SnapshotStore,
};
use crate::command::CommandRunner;
use crate::config::host_view;
use crate::label::SnapshotLabel;
use crate::model::SourceIdentity;

mod locks;

pub use locks::{InFlightGuard, InFlightLabels, SourceLocks};

/// Drives snapshots to a terminal state, at most one bracket per source at
/// a time and at most one attempt per label.
#[derive(Debug)]
pub struct SnapshotOrchestrator<D, R> {
    connector: D,
    driver: BackupDriver<R>,
    host_root: Utf8PathBuf,
    locks: SourceLocks,
    in_flight: InFlightLabels,
}

impl<D, R> SnapshotOrchestrator<D, R>
where
    D: DatabaseConnector,
    R: CommandRunner,
{
    /// Creates an orchestrator. `host_root` is where the node's filesystem
    /// is mounted in this process.
    #[must_use]
    pub fn new(connector: D, driver: BackupDriver<R>, host_root: Utf8PathBuf) -> Self {
        Self {
            connector,
            driver,
            host_root,
            locks: SourceLocks::new(),
            in_flight: InFlightLabels::new(),
        }
    }

    /// Snapshot store written by the driver.
    #[must_use]
    pub const fn store(&self) -> &SnapshotStore {
        self.driver.store()
    }

    /// Labels with an attempt currently running.
    #[must_use]
    pub const fn in_flight(&self) -> &InFlightLabels {
        &self.in_flight
    }

    /// Takes (or reuses) the snapshot `label` of `source`.
    ///
    /// Safe to call repeatedly: a committed directory is returned without a
    /// new session, a directory without marker is removed and redone, and a
    /// label already running elsewhere yields [`BackupError::InFlight`].
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when the snapshot cannot be completed.
    pub async fn snapshot(
        &self,
        source: &SourceIdentity,
        label: &SnapshotLabel,
        cancel: &CancellationToken,
    ) -> Result<CommittedSnapshot, BackupError> {
        let _in_flight = self
            .in_flight
            .claim(label)
            .ok_or_else(|| BackupError::InFlight {
                label: label.clone(),
            })?;

        let identity = source.cluster_identity();
        if self.locks.is_held(&identity) {
            tracing::info!(%label, source = %identity, "waiting for source lock");
        }
        let _source_lock = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BackupError::Cancelled),
            guard = self.locks.acquire(&identity) => guard,
        };

        match self.store().status(label)? {
            SnapshotStatus::Committed => {
                tracing::info!(%label, "reusing committed snapshot");
                return Ok(CommittedSnapshot {
                    label: label.clone(),
                    host_path: self.store().host_path(label),
                    reused: true,
                });
            }
            SnapshotStatus::Partial => {
                tracing::warn!(%label, "removing snapshot directory without completion marker");
                self.store().remove(label).await?;
            }
            SnapshotStatus::Absent => {}
        }

        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BackupError::Cancelled),
            session = self.connector.connect(source) => session?,
        };
        let source_view = self.source_view(&source.data_directory);
        tracing::info!(%label, source = %identity, pod = %source.pod_name, "starting snapshot");
        self.driver.run(session, &source_view, label, cancel).await
    }

    fn source_view(&self, data_directory: &Utf8Path) -> Utf8PathBuf {
        host_view(&self.host_root, data_directory.as_str())
    }
}
