//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::model::VolumeSourceKind;
use crate::retry::Backoff;

/// Default storage class served by the controller.
pub const DEFAULT_STORAGE_CLASS: &str = "pg-reflinker";

/// Default host directory receiving snapshot directories.
pub const DEFAULT_DESTINATION_ROOT: &str = "/var/lib/pg-reflinker";

/// Controller settings merged from defaults, `pg-reflinker.toml` and
/// `PG_REFLINKER_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PG_REFLINKER",
    discovery(
        app_name = "pg-reflinker",
        env_var = "PG_REFLINKER_CONFIG_PATH",
        config_file_name = "pg-reflinker.toml",
        dotfile_name = ".pg-reflinker.toml",
        project_file_name = "pg-reflinker.toml"
    )
)]
pub struct ReflinkerConfig {
    /// Storage class whose claims this controller serves.
    #[ortho_config(default = DEFAULT_STORAGE_CLASS.to_owned())]
    pub storage_class_name: String,
    /// Host path under which snapshot directories are created. It must live
    /// on the same reflink-capable filesystem as the source data.
    #[ortho_config(default = DEFAULT_DESTINATION_ROOT.to_owned())]
    pub destination_root: String,
    /// Where the host filesystem is mounted inside the controller pod.
    #[ortho_config(default = "/".to_owned())]
    pub host_root: String,
    /// Comma-separated namespaces searched, in order, when a data source
    /// omits its namespace.
    #[ortho_config(default = String::new())]
    pub namespace_path: String,
    /// Name of the node this instance runs on, usually injected through the
    /// downward API.
    pub node_name: String,
    /// Subdirectory of the source volume holding `PGDATA`.
    #[ortho_config(default = "pgdata".to_owned())]
    pub pgdata_subdir: String,
    /// Database role used for the backup session.
    #[ortho_config(default = "streaming_replica".to_owned())]
    pub database_user: String,
    /// Database used for the backup session.
    #[ortho_config(default = "postgres".to_owned())]
    pub database_name: String,
    /// Database port.
    #[ortho_config(default = 5432)]
    pub database_port: u16,
    /// Path to the `cp` executable used for reflink copies.
    #[ortho_config(default = "cp".to_owned())]
    pub cp_bin: String,
    /// Volume source written on published volumes: `local` or `host-path`.
    #[ortho_config(default = "local".to_owned())]
    pub volume_source: String,
    /// Overall deadline for one backup bracket, in seconds.
    #[ortho_config(default = 3600)]
    pub backup_timeout_secs: u64,
    /// Attempts made to open a database session before giving up.
    #[ortho_config(default = 5)]
    pub connect_attempts: u32,
    /// First requeue delay after a transient failure, in seconds.
    #[ortho_config(default = 5)]
    pub retry_base_secs: u64,
    /// Upper bound on requeue delays, in seconds.
    #[ortho_config(default = 300)]
    pub retry_max_secs: u64,
    /// Reconciliations allowed to run in parallel.
    #[ortho_config(default = 4)]
    pub workers: u16,
    /// Log output format: `text` or `json`.
    #[ortho_config(default = "text".to_owned())]
    pub log_format: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ReflinkerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to pg-reflinker.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("pg-reflinker")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.node_name,
            &FieldMetadata::new("node name", "PG_REFLINKER_NODE_NAME", "node_name"),
        )?;
        Self::require_field(
            &self.storage_class_name,
            &FieldMetadata::new(
                "storage class name",
                "PG_REFLINKER_STORAGE_CLASS_NAME",
                "storage_class_name",
            ),
        )?;
        Self::require_field(
            &self.destination_root,
            &FieldMetadata::new(
                "snapshot destination root",
                "PG_REFLINKER_DESTINATION_ROOT",
                "destination_root",
            ),
        )?;
        Self::require_field(
            &self.database_user,
            &FieldMetadata::new("database user", "PG_REFLINKER_DATABASE_USER", "database_user"),
        )?;
        Self::require_field(
            &self.cp_bin,
            &FieldMetadata::new("cp executable", "PG_REFLINKER_CP_BIN", "cp_bin"),
        )?;

        if !self.destination_root.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: String::from("destination_root"),
                message: String::from("must be an absolute path"),
            });
        }
        if self.pgdata_subdir.contains("..") {
            return Err(ConfigError::Invalid {
                field: String::from("pgdata_subdir"),
                message: String::from("must not contain '..'"),
            });
        }
        if self.backup_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("backup_timeout_secs"),
                message: String::from("must be greater than zero"),
            });
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("connect_attempts"),
                message: String::from("must be greater than zero"),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("workers"),
                message: String::from("must be greater than zero"),
            });
        }
        self.volume_source_kind()?;
        self.log_format()?;
        Ok(())
    }

    /// Returns the ordered namespace search list, skipping blanks.
    #[must_use]
    pub fn namespace_search_path(&self) -> Vec<String> {
        self.namespace_path
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Parses [`ReflinkerConfig::volume_source`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown values.
    pub fn volume_source_kind(&self) -> Result<VolumeSourceKind, ConfigError> {
        match self.volume_source.trim() {
            "local" => Ok(VolumeSourceKind::Local),
            "host-path" | "hostPath" => Ok(VolumeSourceKind::HostPath),
            other => Err(ConfigError::Invalid {
                field: String::from("volume_source"),
                message: format!("expected 'local' or 'host-path', got '{other}'"),
            }),
        }
    }

    /// Parses [`ReflinkerConfig::log_format`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown values.
    pub fn log_format(&self) -> Result<LogFormat, ConfigError> {
        match self.log_format.trim() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid {
                field: String::from("log_format"),
                message: format!("expected 'text' or 'json', got '{other}'"),
            }),
        }
    }

    /// Destination root as seen from the host.
    #[must_use]
    pub fn destination_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.destination_root)
    }

    /// Translates a host path into the path visible inside this pod.
    #[must_use]
    pub fn host_view(&self, host_path: &str) -> Utf8PathBuf {
        host_view(Utf8Path::new(&self.host_root), host_path)
    }

    /// Overall deadline for one backup bracket.
    #[must_use]
    pub const fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    /// Requeue backoff for transient reconcile failures.
    #[must_use]
    pub const fn requeue_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.retry_base_secs),
            Duration::from_secs(self.retry_max_secs),
        )
    }
}

/// Joins a host path onto the mount point of the host filesystem.
#[must_use]
pub fn host_view(host_root: &Utf8Path, host_path: &str) -> Utf8PathBuf {
    host_root.join(host_path.trim_start_matches('/'))
}

/// Log formatter selected by [`ReflinkerConfig::log_format`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Field name.
        field: String,
        /// Description of the accepted values.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
