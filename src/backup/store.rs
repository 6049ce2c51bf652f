//! Snapshot directories under the destination root.
//!
//! All filesystem access goes through a `cap-std` handle opened on the
//! destination root, so a label can only ever address a direct child of it.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::label::SnapshotLabel;

/// Completion marker; its presence is the only proof a snapshot is whole.
pub const BACKUP_LABEL_FILE: &str = "backup_label";

/// Suffix of files being written before they are renamed into place.
const STAGING_SUFFIX: &str = ".partial";

/// Tablespace map written next to the marker when the server returns one.
pub const TABLESPACE_MAP_FILE: &str = "tablespace_map";

/// Files describing the running server that must not survive in a clone.
pub const RUNTIME_FILES: [&str; 2] = ["postmaster.pid", "postmaster.opts"];

/// Errors raised by snapshot store operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("snapshot store I/O failed for {path}: {message}")]
pub struct StoreError {
    /// Path being accessed.
    pub path: Utf8PathBuf,
    /// Operating system error string.
    pub message: String,
}

/// State of one snapshot directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotStatus {
    /// No directory exists.
    Absent,
    /// A directory exists without a non-empty completion marker.
    Partial,
    /// A non-empty completion marker is present.
    Committed,
}

/// Entry returned by [`SnapshotStore::list`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredSnapshot {
    /// Directory name.
    pub name: String,
    /// Whether the completion marker is present.
    pub committed: bool,
    /// Last modification time of the directory.
    pub modified: Option<SystemTime>,
}

/// Handle on the destination root.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    host_root: Utf8PathBuf,
    view_root: Utf8PathBuf,
    dir: Arc<Dir>,
}

impl SnapshotStore {
    /// Opens (creating if needed) the destination root.
    ///
    /// `host_root` is the root as the node sees it and is what published
    /// volumes reference; `view_root` is where this process reaches it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory cannot be created or opened.
    pub fn open(host_root: &Utf8Path, view_root: &Utf8Path) -> Result<Self, StoreError> {
        Dir::create_ambient_dir_all(view_root, ambient_authority())
            .map_err(|err| io_error(view_root, &err))?;
        let dir = Dir::open_ambient_dir(view_root, ambient_authority())
            .map_err(|err| io_error(view_root, &err))?;
        Ok(Self {
            host_root: host_root.to_path_buf(),
            view_root: view_root.to_path_buf(),
            dir: Arc::new(dir),
        })
    }

    /// Destination root as the node sees it.
    #[must_use]
    pub fn host_root(&self) -> &Utf8Path {
        &self.host_root
    }

    /// Snapshot directory as the node sees it.
    #[must_use]
    pub fn host_path(&self, label: &SnapshotLabel) -> Utf8PathBuf {
        self.host_root.join(label.as_str())
    }

    /// Snapshot directory as this process reaches it.
    #[must_use]
    pub fn view_path(&self, label: &SnapshotLabel) -> Utf8PathBuf {
        self.view_root.join(label.as_str())
    }

    /// Reports whether the snapshot directory is absent, partial or committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory cannot be inspected.
    pub fn status(&self, label: &SnapshotLabel) -> Result<SnapshotStatus, StoreError> {
        let name = label.as_str();
        let exists = self
            .dir
            .try_exists(name)
            .map_err(|err| self.child_error(name, &err))?;
        if !exists {
            return Ok(SnapshotStatus::Absent);
        }
        Ok(if self.has_marker(name)? {
            SnapshotStatus::Committed
        } else {
            SnapshotStatus::Partial
        })
    }

    /// Removes server runtime files copied from the live data directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a present file cannot be removed.
    pub fn strip_runtime_files(&self, label: &SnapshotLabel) -> Result<(), StoreError> {
        for file in RUNTIME_FILES {
            let path = Utf8Path::new(label.as_str()).join(file);
            match self.dir.remove_file(&path) {
                Ok(()) => tracing::debug!(%label, file, "removed runtime file from clone"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(self.child_error(path.as_str(), &err)),
            }
        }
        Ok(())
    }

    /// Writes `tablespace_map` into the snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file cannot be written.
    pub fn write_tablespace_map(
        &self,
        label: &SnapshotLabel,
        contents: &str,
    ) -> Result<(), StoreError> {
        self.write_synced(label, TABLESPACE_MAP_FILE, contents)
    }

    /// Writes the completion marker. Must be the last write of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file cannot be written.
    pub fn write_marker(&self, label: &SnapshotLabel, contents: &str) -> Result<(), StoreError> {
        self.write_synced(label, BACKUP_LABEL_FILE, contents)
    }

    /// Recursively removes a snapshot directory. Returns `false` when there
    /// was nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when removal fails.
    pub async fn remove(&self, label: &SnapshotLabel) -> Result<bool, StoreError> {
        let dir = Arc::clone(&self.dir);
        let name = label.as_str().to_owned();
        let path = self.view_path(label);
        let outcome = tokio::task::spawn_blocking(move || match dir.remove_dir_all(&name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        })
        .await
        .map_err(|err| StoreError {
            path: path.clone(),
            message: err.to_string(),
        })?;
        outcome.map_err(|err| io_error(&path, &err))
    }

    /// Lists the directories directly under the root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the root cannot be read.
    pub fn list(&self) -> Result<Vec<StoredSnapshot>, StoreError> {
        let entries = self
            .dir
            .entries()
            .map_err(|err| io_error(&self.view_root, &err))?;
        let mut snapshots = Vec::new();
        for entry in entries {
            let found = entry.map_err(|err| io_error(&self.view_root, &err))?;
            let file_type = found
                .file_type()
                .map_err(|err| io_error(&self.view_root, &err))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = found
                .file_name()
                .map_err(|err| io_error(&self.view_root, &err))?;
            let committed = self.has_marker(&name)?;
            let modified = found
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok()
                .map(cap_std::time::SystemTime::into_std);
            snapshots.push(StoredSnapshot {
                name,
                committed,
                modified,
            });
        }
        snapshots.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(snapshots)
    }

    /// Writes `file` under a staging name, syncs it, renames it into place
    /// and syncs the snapshot directory, so `file` is either absent or whole.
    fn write_synced(
        &self,
        label: &SnapshotLabel,
        file: &str,
        contents: &str,
    ) -> Result<(), StoreError> {
        let target = Utf8Path::new(label.as_str()).join(file);
        let staging = Utf8Path::new(label.as_str()).join(format!("{file}{STAGING_SUFFIX}"));
        let mut handle = self
            .dir
            .create(&staging)
            .map_err(|err| self.child_error(staging.as_str(), &err))?;
        handle
            .write_all(contents.as_bytes())
            .and_then(|()| handle.sync_all())
            .map_err(|err| self.child_error(staging.as_str(), &err))?;
        self.dir
            .rename(&staging, &self.dir, &target)
            .map_err(|err| self.child_error(target.as_str(), &err))?;
        self.dir
            .open(label.as_str())
            .and_then(|directory| directory.sync_all())
            .map_err(|err| self.child_error(label.as_str(), &err))?;
        tracing::debug!(%label, file, "wrote snapshot file");
        Ok(())
    }

    /// A marker counts only when it exists and is not empty.
    fn has_marker(&self, name: &str) -> Result<bool, StoreError> {
        let marker = Utf8Path::new(name).join(BACKUP_LABEL_FILE);
        match self.dir.metadata(&marker) {
            Ok(metadata) => Ok(metadata.is_file() && metadata.len() > 0),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.child_error(marker.as_str(), &err)),
        }
    }

    fn child_error(&self, child: &str, err: &io::Error) -> StoreError {
        io_error(&self.view_root.join(child), err)
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
