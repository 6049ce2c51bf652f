//! Reconcile-level errors and their requeue policy.

use thiserror::Error;

use crate::backup::BackupError;
use crate::cluster::ClusterError;
use crate::label::LabelError;
use crate::provisioner::ProvisionError;
use crate::resolver::ResolveError;

/// Failure of one reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The source could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The snapshot could not be taken.
    #[error(transparent)]
    Backup(#[from] BackupError),
    /// The volume could not be published.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// The request uid cannot serve as a snapshot label.
    #[error("cannot derive snapshot label: {0}")]
    Label(#[from] LabelError),
    /// A cluster API call failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// The object handed to the reconciler is unusable.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl ReconcileError {
    /// Returns `true` when the request should be requeued with backoff;
    /// `false` when retrying cannot help until the object changes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Resolve(err) => err.is_transient(),
            Self::Backup(err) => err.is_transient(),
            Self::Provision(err) => err.is_transient(),
            Self::Label(_) | Self::Invalid(_) => false,
            Self::Cluster(ClusterError::Malformed { .. }) => false,
            Self::Cluster(_) => true,
        }
    }

    /// Returns `true` for failures worth surfacing on the claim.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        match self {
            Self::Backup(err) => !matches!(
                err.root_cause(),
                BackupError::InFlight { .. } | BackupError::Cancelled
            ),
            _ => true,
        }
    }
}
