//! Core library for the pg-reflinker controller.
//!
//! The crate provisions Kubernetes persistent volumes as reflink clones of a
//! live CloudNativePG data directory. Each clone is bracketed by the
//! database's online-backup calls so it is crash-consistent, published only
//! once its `backup_label` is on disk, and removed again when its volume is
//! deleted with a `Delete` reclaim policy.

pub mod backup;
pub mod cleanup;
pub mod cluster;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod janitor;
pub mod label;
pub mod model;
pub mod orchestrator;
pub mod provisioner;
pub mod resolver;
pub mod retry;
pub mod telemetry;
pub mod test_support;

pub use backup::{BackupDriver, BackupError, SnapshotStore};
pub use cleanup::{CleanupController, CleanupError, CleanupOutcome};
pub use cluster::{ClusterApi, ClusterError, KubeCluster};
pub use config::{ConfigError, ReflinkerConfig};
pub use controller::{Reconciler, RequestOutcome, VolumeOutcome};
pub use error::ReconcileError;
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepSummary};
pub use label::{LabelError, SnapshotLabel};
pub use orchestrator::SnapshotOrchestrator;
pub use provisioner::{ProvisionError, PublishOutcome, VolumeProvisioner};
pub use resolver::{ResolveError, SourceResolver};
