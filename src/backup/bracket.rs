//! Explicit state machine around one backup session.

use std::fmt;

use super::{BackupError, BackupSession, BackupStopOutput};
use crate::label::SnapshotLabel;

/// Lifecycle of one snapshot attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Session open, backup not yet started.
    NotStarted,
    /// Backup mode entered on the server.
    Started,
    /// Clone of the data directory running.
    Copying,
    /// Backup mode left; stop output received.
    Stopped,
    /// Completion marker written.
    Committed,
    /// Attempt abandoned; any backup mode has been ended.
    Aborted,
}

impl SessionState {
    /// Returns `true` while the server is (or may be) in backup mode for
    /// this session.
    #[must_use]
    pub const fn holds_backup(self) -> bool {
        matches!(self, Self::Started | Self::Copying)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Started => "started",
            Self::Copying => "copying",
            Self::Stopped => "stopped",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A backup session plus the state guarding which calls are legal.
///
/// Stop is issued at most once: either as the normal completion in
/// [`BackupBracket::stop`] or as the corrective stop in
/// [`BackupBracket::abort`].
pub struct BackupBracket {
    session: Option<Box<dyn BackupSession>>,
    label: SnapshotLabel,
    state: SessionState,
    stop_issued: bool,
}

impl fmt::Debug for BackupBracket {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BackupBracket")
            .field("label", &self.label)
            .field("state", &self.state)
            .field("stop_issued", &self.stop_issued)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl BackupBracket {
    /// Wraps an open session for `label`.
    #[must_use]
    pub fn new(session: Box<dyn BackupSession>, label: SnapshotLabel) -> Self {
        Self {
            session: Some(session),
            label,
            state: SessionState::NotStarted,
            stop_issued: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Label the bracket was opened for.
    #[must_use]
    pub const fn label(&self) -> &SnapshotLabel {
        &self.label
    }

    /// Enters backup mode. `NotStarted -> Started`.
    ///
    /// A failed start leaves the state unchanged: the server never entered
    /// backup mode, so no stop is owed.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::State`] outside `NotStarted` and the session's
    /// error when the server rejects the call.
    pub async fn start(&mut self, fast: bool) -> Result<(), BackupError> {
        self.expect_state("start", SessionState::NotStarted)?;
        let state = self.state;
        let session = self.session.as_mut().ok_or(BackupError::State {
            operation: "start",
            state,
        })?;
        session.start(&self.label, fast).await?;
        self.transition(SessionState::Started);
        Ok(())
    }

    /// Marks the clone as running. `Started -> Copying`.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::State`] outside `Started`.
    pub fn begin_copy(&mut self) -> Result<(), BackupError> {
        self.expect_state("copy", SessionState::Started)?;
        self.transition(SessionState::Copying);
        Ok(())
    }

    /// Leaves backup mode. `Copying -> Stopped`.
    ///
    /// When the stop call fails the session is closed, which ends the backup
    /// on the server, and the bracket moves to `Aborted`.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::State`] outside `Copying` and the session's
    /// error when the stop call fails.
    pub async fn stop(&mut self) -> Result<BackupStopOutput, BackupError> {
        self.expect_state("stop", SessionState::Copying)?;
        self.stop_issued = true;
        let result = self.session_mut("stop")?.stop(false).await;
        match result {
            Ok(output) => {
                self.transition(SessionState::Stopped);
                Ok(output)
            }
            Err(err) => {
                self.close().await;
                self.transition(SessionState::Aborted);
                Err(err)
            }
        }
    }

    /// Records the completion marker as written. `Stopped -> Committed`,
    /// then closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::State`] outside `Stopped`.
    pub async fn commit(&mut self) -> Result<(), BackupError> {
        self.expect_state("commit", SessionState::Stopped)?;
        self.transition(SessionState::Committed);
        self.close().await;
        Ok(())
    }

    /// Abandons the attempt. Issues the corrective stop when the server may
    /// still be in backup mode and no stop has been sent, then closes the
    /// session. Returns a note describing any failure along the way.
    pub async fn abort(&mut self) -> Option<String> {
        if matches!(self.state, SessionState::Committed | SessionState::Aborted) {
            self.close().await;
            return None;
        }
        let mut note = None;
        if self.state.holds_backup() && !self.stop_issued {
            self.stop_issued = true;
            if let Some(session) = self.session.as_mut() {
                tracing::warn!(label = %self.label, state = %self.state, "issuing corrective backup stop");
                if let Err(err) = session.stop(false).await {
                    note = Some(format!("corrective backup stop failed: {err}"));
                }
            }
        }
        self.close().await;
        self.transition(SessionState::Aborted);
        note
    }

    /// Drops the session without further calls and marks the attempt
    /// aborted. Used when the corrective stop itself cannot finish; the
    /// server ends the backup once the connection goes away.
    pub fn discard(&mut self) {
        drop(self.session.take());
        self.transition(SessionState::Aborted);
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(err) = session.close().await
        {
            tracing::warn!(label = %self.label, error = %err, "closing backup session failed");
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(label = %self.label, from = %self.state, to = %next, "backup session transition");
        self.state = next;
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(), BackupError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BackupError::State {
                operation,
                state: self.state,
            })
        }
    }

    fn session_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Box<dyn BackupSession>, BackupError> {
        let state = self.state;
        self.session
            .as_mut()
            .ok_or(BackupError::State { operation, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::validate;
    use crate::test_support::{FakeDatabase, sample_source};

    async fn open(database: &FakeDatabase) -> BackupBracket {
        use crate::backup::DatabaseConnector;
        let session = database
            .connect(&sample_source())
            .await
            .expect("connect");
        BackupBracket::new(session, validate("snap-a").expect("label"))
    }

    #[tokio::test]
    async fn happy_path_stops_once_and_closes() {
        let database = FakeDatabase::new();
        let mut bracket = open(&database).await;

        bracket.start(true).await.expect("start");
        bracket.begin_copy().expect("copy");
        let output = bracket.stop().await.expect("stop");
        bracket.commit().await.expect("commit");

        assert_eq!(bracket.state(), SessionState::Committed);
        assert!(output.label_file.contains("snap-a"));
        assert_eq!(database.start_calls(), 1);
        assert_eq!(database.stop_calls(), 1);
        assert_eq!(database.open_sessions(), 0);
        assert!(bracket.abort().await.is_none());
        assert_eq!(database.stop_calls(), 1);
    }

    #[tokio::test]
    async fn abort_during_copy_issues_exactly_one_stop() {
        let database = FakeDatabase::new();
        let mut bracket = open(&database).await;
        bracket.start(true).await.expect("start");
        bracket.begin_copy().expect("copy");

        assert!(bracket.abort().await.is_none());
        assert!(bracket.abort().await.is_none());

        assert_eq!(bracket.state(), SessionState::Aborted);
        assert_eq!(database.stop_calls(), 1);
        assert!(!database.in_backup());
    }

    #[tokio::test]
    async fn failed_stop_closes_session_without_second_stop() {
        let database = FakeDatabase::new();
        database.fail_next_stop("WAL segment missing");
        let mut bracket = open(&database).await;
        bracket.start(true).await.expect("start");
        bracket.begin_copy().expect("copy");

        let err = bracket.stop().await.expect_err("stop fails");
        assert!(matches!(err, BackupError::Protocol { .. }));
        assert_eq!(bracket.state(), SessionState::Aborted);
        assert!(bracket.abort().await.is_none());
        assert_eq!(database.stop_calls(), 1);
        assert_eq!(database.open_sessions(), 0);
        assert!(!database.in_backup());
    }

    #[tokio::test]
    async fn abort_before_start_sends_no_stop() {
        let database = FakeDatabase::new();
        let mut bracket = open(&database).await;
        assert!(bracket.abort().await.is_none());
        assert_eq!(database.stop_calls(), 0);
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let database = FakeDatabase::new();
        let mut bracket = open(&database).await;
        let err = bracket.begin_copy().expect_err("copy before start");
        assert!(matches!(
            err,
            BackupError::State {
                operation: "copy",
                state: SessionState::NotStarted
            }
        ));
    }
}
