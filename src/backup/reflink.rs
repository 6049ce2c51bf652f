//! Copy-on-write cloning of a data directory with `cp --reflink=always`.

use std::ffi::OsString;

use camino::Utf8Path;

use super::BackupError;
use crate::command::{CommandRunner, render_command};

/// Clones directory trees through the configured `cp` binary.
#[derive(Clone, Debug)]
pub struct ReflinkCopier<R> {
    runner: R,
    cp_bin: String,
}

impl<R: CommandRunner> ReflinkCopier<R> {
    /// Creates a copier invoking `cp_bin` through `runner`.
    #[must_use]
    pub const fn new(runner: R, cp_bin: String) -> Self {
        Self { runner, cp_bin }
    }

    /// Builds the argument vector for cloning `source` to `destination`.
    ///
    /// `destination` must not exist yet so `cp` creates it as the copy.
    #[must_use]
    pub fn clone_args(source: &Utf8Path, destination: &Utf8Path) -> Vec<OsString> {
        vec![
            OsString::from("-a"),
            OsString::from("--reflink=always"),
            OsString::from(source.as_str()),
            OsString::from(destination.as_str()),
        ]
    }

    /// Clones `source` to `destination`. Fails rather than falling back to a
    /// full copy when the filesystem cannot share extents.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Command`] when `cp` cannot be spawned and
    /// [`BackupError::Copy`] when it exits unsuccessfully.
    pub async fn clone_tree(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), BackupError> {
        let args = Self::clone_args(source, destination);
        let command = render_command(&self.cp_bin, &args);
        tracing::info!(%command, "cloning data directory");
        let output = self.runner.run(&self.cp_bin, &args).await?;
        if output.is_success() {
            return Ok(());
        }
        Err(BackupError::Copy {
            command,
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
