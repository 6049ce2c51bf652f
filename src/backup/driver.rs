//! Sequencing of one snapshot bracket.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{BackupBracket, BackupError, BackupSession, ReflinkCopier, SnapshotStore};
use crate::command::CommandRunner;
use crate::label::SnapshotLabel;

const ABORT_GRACE: Duration = Duration::from_secs(30);

/// A snapshot whose completion marker is on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommittedSnapshot {
    /// Snapshot label.
    pub label: SnapshotLabel,
    /// Snapshot directory as the node sees it.
    pub host_path: Utf8PathBuf,
    /// Whether an existing committed directory was reused.
    pub reused: bool,
}

/// Drives start, clone, stop and commit for one label, running the abort
/// path on any failure, deadline expiry or cancellation.
#[derive(Clone, Debug)]
pub struct BackupDriver<R> {
    copier: ReflinkCopier<R>,
    store: SnapshotStore,
    deadline: Duration,
}

impl<R: CommandRunner> BackupDriver<R> {
    /// Creates a driver writing into `store`.
    #[must_use]
    pub const fn new(copier: ReflinkCopier<R>, store: SnapshotStore, deadline: Duration) -> Self {
        Self {
            copier,
            store,
            deadline,
        }
    }

    /// Snapshot store the driver writes into.
    #[must_use]
    pub const fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Brackets a clone of `source_view` into the directory for `label`.
    ///
    /// The destination directory must not exist. On success the completion
    /// marker has been written last and the session is closed. On failure
    /// exactly one stop has been issued if backup mode was entered, the
    /// session is closed and the partial directory removed.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Aborted`] wrapping the primary failure,
    /// including [`BackupError::Timeout`] and [`BackupError::Cancelled`].
    pub async fn run(
        &self,
        session: Box<dyn BackupSession>,
        source_view: &Utf8Path,
        label: &SnapshotLabel,
        cancel: &CancellationToken,
    ) -> Result<CommittedSnapshot, BackupError> {
        let mut bracket = BackupBracket::new(session, label.clone());
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BackupError::Cancelled),
            result = timeout(self.deadline, self.drive(&mut bracket, source_view)) => {
                result.unwrap_or_else(|_| Err(BackupError::Timeout {
                    seconds: self.deadline.as_secs(),
                }))
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(%label, "snapshot committed");
                Ok(CommittedSnapshot {
                    label: label.clone(),
                    host_path: self.store.host_path(label),
                    reused: false,
                })
            }
            Err(err) => Err(self.abort(&mut bracket, err).await),
        }
    }

    async fn drive(
        &self,
        bracket: &mut BackupBracket,
        source_view: &Utf8Path,
    ) -> Result<(), BackupError> {
        let label = bracket.label().clone();
        bracket.start(true).await?;
        tracing::info!(%label, "backup started");

        bracket.begin_copy()?;
        self.copier
            .clone_tree(source_view, &self.store.view_path(&label))
            .await?;
        self.store.strip_runtime_files(&label)?;

        let output = bracket.stop().await?;
        tracing::info!(%label, "backup stopped");

        if !output.tablespace_map.trim().is_empty() {
            self.store
                .write_tablespace_map(&label, &output.tablespace_map)?;
        }
        self.store.write_marker(&label, &output.label_file)?;
        bracket.commit().await
    }

    async fn abort(&self, bracket: &mut BackupBracket, primary: BackupError) -> BackupError {
        let label = bracket.label().clone();
        tracing::warn!(%label, state = %bracket.state(), error = %primary, "aborting snapshot");

        let stop_note = if let Ok(note) = timeout(ABORT_GRACE, bracket.abort()).await {
            note
        } else {
            bracket.discard();
            Some(String::from("corrective backup stop timed out; session dropped"))
        };
        let removal_note = match self.store.remove(&label).await {
            Ok(removed) => {
                if removed {
                    tracing::info!(%label, "removed partial snapshot directory");
                }
                None
            }
            Err(err) => Some(format!("partial snapshot removal failed: {err}")),
        };

        let message = append_abort_notes(primary.to_string(), [stop_note, removal_note]);
        BackupError::Aborted {
            message,
            source: Box::new(primary),
        }
    }
}

fn append_abort_notes(message: String, notes: [Option<String>; 2]) -> String {
    notes
        .into_iter()
        .flatten()
        .fold(message, |acc, note| format!("{acc} (abort: {note})"))
}
