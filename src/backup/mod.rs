//! Backup session driver.
//!
//! A reflink copy of a live data directory is only crash-consistent when it
//! is bracketed by the database's online-backup calls and completed with the
//! `backup_label` the stop call returns. This module owns that bracket: the
//! [`BackupSession`] seam over the database connection, the explicit
//! [`SessionState`] machine guarding it, the on-disk [`SnapshotStore`], and
//! the [`BackupDriver`] that sequences start, copy, stop and commit, running
//! the abort path on any failure.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::command::CommandError;
use crate::label::SnapshotLabel;
use crate::model::SourceIdentity;

mod bracket;
mod driver;
pub mod postgres;
mod reflink;
mod store;

pub use bracket::{BackupBracket, SessionState};
pub use driver::{BackupDriver, CommittedSnapshot};
pub use postgres::PostgresConnector;
pub use reflink::ReflinkCopier;
pub use store::{
    BACKUP_LABEL_FILE, RUNTIME_FILES, SnapshotStatus, SnapshotStore, StoreError, StoredSnapshot,
    TABLESPACE_MAP_FILE,
};

/// Future returned by backup session operations.
pub type BackupFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackupError>> + Send + 'a>>;

/// Files returned by the database when a backup ends.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BackupStopOutput {
    /// Contents for `backup_label`.
    pub label_file: String,
    /// Contents for `tablespace_map`; empty when there are no tablespaces.
    pub tablespace_map: String,
}

/// One open database session able to run a non-exclusive backup.
///
/// The backup belongs to the session: closing the session ends any backup
/// still in progress on the server.
pub trait BackupSession: Send {
    /// Enters backup mode under `label`.
    fn start<'a>(&'a mut self, label: &'a SnapshotLabel, fast: bool) -> BackupFuture<'a, ()>;

    /// Leaves backup mode and returns the files needed to complete the copy.
    fn stop(&mut self, wait_for_archive: bool) -> BackupFuture<'_, BackupStopOutput>;

    /// Closes the session.
    fn close(self: Box<Self>) -> BackupFuture<'static, ()>;
}

/// Opens backup sessions against a resolved source.
pub trait DatabaseConnector: Send + Sync {
    /// Connects to the source instance.
    fn connect<'a>(&'a self, source: &'a SourceIdentity)
    -> BackupFuture<'a, Box<dyn BackupSession>>;
}

/// Errors raised while taking a snapshot.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Raised when no session can be opened.
    #[error("failed to connect to {target}: {message}")]
    Connect {
        /// Host and database the session targeted.
        target: String,
        /// Driver error message.
        message: String,
    },
    /// Raised when TLS material cannot be used.
    #[error("invalid database credentials: {message}")]
    Credentials {
        /// Driver error message.
        message: String,
    },
    /// Raised when a backup call is rejected by the server.
    #[error("{operation} failed: {message}")]
    Protocol {
        /// Backup call that failed.
        operation: &'static str,
        /// Server error message.
        message: String,
    },
    /// Raised when a session operation is issued in the wrong state.
    #[error("cannot {operation} a backup session in state {state}")]
    State {
        /// Attempted operation.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },
    /// Raised when the copy command exits unsuccessfully.
    #[error("copy command `{command}` exited with status {status}: {stderr}")]
    Copy {
        /// Rendered command line.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the copy command cannot be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the snapshot directory cannot be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when the same label is already being snapshotted.
    #[error("snapshot {label} is already in progress")]
    InFlight {
        /// Label of the running snapshot.
        label: SnapshotLabel,
    },
    /// Raised when the bracket exceeds its deadline.
    #[error("backup did not complete within {seconds} seconds")]
    Timeout {
        /// Deadline in seconds.
        seconds: u64,
    },
    /// Raised when the request was withdrawn mid-flight.
    #[error("backup cancelled")]
    Cancelled,
    /// Wraps the primary failure once the abort path has run.
    #[error("{message}")]
    Aborted {
        /// Primary failure with any abort-path notes appended.
        message: String,
        /// Primary failure.
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Returns the failure that triggered the abort path.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Aborted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` when retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self.root_cause(), Self::State { .. } | Self::Cancelled)
    }
}
