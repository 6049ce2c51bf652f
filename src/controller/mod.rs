//! Reconciliation of claims and published volumes.
//!
//! [`Reconciler`] holds the per-object logic and is independent of the watch
//! machinery; [`run`] drives it from two `kube` controllers, one over claims
//! and one over the volumes this controller published.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backup::{BackupError, DatabaseConnector};
use crate::cleanup::{CleanupController, CleanupOutcome};
use crate::cluster::{ClusterApi, ClusterError};
use crate::command::CommandRunner;
use crate::config::{ConfigError, ReflinkerConfig};
use crate::error::ReconcileError;
use crate::label::{self, SnapshotLabel};
use crate::model::{
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, PublishedVolume, ReclaimPolicy, SourceIdentity,
    VolumeRecord, VolumeRequest, annotations,
};
use crate::orchestrator::SnapshotOrchestrator;
use crate::provisioner::{self, PublishOutcome, VolumeProvisioner};
use crate::resolver::SourceResolver;

mod runtime;

pub use runtime::{ControllerError, run};

/// How often a running snapshot re-reads its claim to detect withdrawal.
pub const DEFAULT_WITHDRAWAL_POLL: Duration = Duration::from_secs(5);

/// Why a claim needs no work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IgnoreReason {
    /// The claim asks for another storage class.
    OtherStorageClass,
    /// The claim is being deleted.
    Deleting,
    /// The claim is already bound.
    Bound,
}

/// Result of reconciling one claim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestOutcome {
    /// Nothing to do.
    Ignored(IgnoreReason),
    /// The source lives on another node; that node's instance serves it.
    NotLocal {
        /// Node holding the source.
        node: String,
    },
    /// A volume for this claim's snapshot already exists.
    AlreadyPublished {
        /// Volume name.
        volume: String,
    },
    /// A snapshot was taken (or reused) and published.
    Published(PublishOutcome),
    /// The claim disappeared while its snapshot was running.
    Withdrawn {
        /// Label of the abandoned snapshot.
        label: SnapshotLabel,
    },
}

/// Result of reconciling one published volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeOutcome {
    /// The volume was not published by this controller.
    Unmanaged,
    /// The snapshot lives on another node.
    NotOnThisNode,
    /// The volume was `Failed` and has been deleted.
    FailedDeleted,
    /// Nothing to do.
    Healthy,
}

/// Per-object reconciliation logic for one node.
#[derive(Debug)]
pub struct Reconciler<C, D, R> {
    cluster: Arc<C>,
    resolver: SourceResolver<C>,
    orchestrator: SnapshotOrchestrator<D, R>,
    provisioner: VolumeProvisioner<C>,
    cleanup: CleanupController<C>,
    storage_class: String,
    withdrawal_poll: Duration,
}

impl<C, D, R> Reconciler<C, D, R>
where
    C: ClusterApi,
    D: DatabaseConnector,
    R: CommandRunner,
{
    /// Assembles a reconciler from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the volume source is unknown.
    pub fn new(
        cluster: Arc<C>,
        orchestrator: SnapshotOrchestrator<D, R>,
        config: &ReflinkerConfig,
    ) -> Result<Self, ConfigError> {
        let resolver = SourceResolver::new(
            Arc::clone(&cluster),
            config.namespace_search_path(),
            config.pgdata_subdir.clone(),
            config.node_name.clone(),
        );
        let provisioner = VolumeProvisioner::new(Arc::clone(&cluster), config.volume_source_kind()?);
        let cleanup = CleanupController::new(
            Arc::clone(&cluster),
            orchestrator.store().clone(),
            config.node_name.clone(),
        );
        Ok(Self {
            cluster,
            resolver,
            orchestrator,
            provisioner,
            cleanup,
            storage_class: config.storage_class_name.clone(),
            withdrawal_poll: DEFAULT_WITHDRAWAL_POLL,
        })
    }

    /// Overrides how often running snapshots check for withdrawal.
    #[must_use]
    pub const fn with_withdrawal_poll(mut self, interval: Duration) -> Self {
        self.withdrawal_poll = interval;
        self
    }

    /// Snapshot orchestrator used for claims.
    #[must_use]
    pub const fn orchestrator(&self) -> &SnapshotOrchestrator<D, R> {
        &self.orchestrator
    }

    /// Returns `true` when this instance handles the volume's cleanup.
    #[must_use]
    pub fn owns_volume(&self, volume: &VolumeRecord) -> bool {
        is_managed(volume) && self.cleanup.owns(volume)
    }

    /// Serves one claim: resolves its source, snapshots it and publishes
    /// the volume. Failures are recorded on the claim's last-error
    /// annotation, which is cleared again on success.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`]; its
    /// [`is_transient`](ReconcileError::is_transient) decides the requeue.
    pub async fn reconcile_request(
        &self,
        request: &VolumeRequest,
    ) -> Result<RequestOutcome, ReconcileError> {
        match self.serve(request).await {
            Ok(outcome) => {
                if request.annotations.contains_key(annotations::LAST_ERROR)
                    && matches!(
                        outcome,
                        RequestOutcome::Published(_) | RequestOutcome::AlreadyPublished { .. }
                    )
                {
                    self.record_error(request, None).await;
                }
                Ok(outcome)
            }
            Err(err) => {
                if err.is_reportable() {
                    let message = err.to_string();
                    self.record_error(request, Some(&message)).await;
                }
                Err(err)
            }
        }
    }

    async fn serve(&self, request: &VolumeRequest) -> Result<RequestOutcome, ReconcileError> {
        if request.storage_class.as_deref() != Some(self.storage_class.as_str()) {
            return Ok(RequestOutcome::Ignored(IgnoreReason::OtherStorageClass));
        }
        if request.deleting {
            return Ok(RequestOutcome::Ignored(IgnoreReason::Deleting));
        }
        if request.volume_name.is_some() {
            return Ok(RequestOutcome::Ignored(IgnoreReason::Bound));
        }

        let source = self.resolver.resolve(request).await?;
        if !self.resolver.is_local(&source) {
            tracing::debug!(request = %request.key(), node = %source.node_name, "source is not local");
            return Ok(RequestOutcome::NotLocal {
                node: source.node_name,
            });
        }

        let snapshot_label = label::derive(request.uid.as_deref())?;
        provisioner::requested_capacity(request)?;
        let volume_name = PublishedVolume::name_for(&snapshot_label);
        if let Some(existing) = self.cluster.get_volume(&volume_name).await? {
            provisioner::ensure_published_for(&existing, request, &source, &snapshot_label)?;
            tracing::debug!(request = %request.key(), volume = %volume_name, "already published");
            return Ok(RequestOutcome::AlreadyPublished {
                volume: volume_name,
            });
        }

        tracing::info!(
            request = %request.key(),
            source = %source.cluster_identity(),
            label = %snapshot_label,
            "snapshot requested"
        );
        let snapshot = match self.snapshot_until_withdrawn(request, &source, &snapshot_label).await {
            Ok(snapshot) => snapshot,
            Err(err) if matches!(err.root_cause(), BackupError::Cancelled) => {
                tracing::info!(request = %request.key(), label = %snapshot_label, "claim withdrawn, snapshot abandoned");
                return Ok(RequestOutcome::Withdrawn {
                    label: snapshot_label,
                });
            }
            Err(err) => return Err(err.into()),
        };
        if self.withdrawn(request).await? {
            tracing::info!(request = %request.key(), label = %snapshot_label, "claim withdrawn after commit, volume not published");
            self.discard_committed(request, &snapshot_label).await;
            return Ok(RequestOutcome::Withdrawn {
                label: snapshot_label,
            });
        }

        let outcome = self
            .provisioner
            .publish(request, &source, &snapshot, self.orchestrator.store())
            .await?;
        Ok(RequestOutcome::Published(outcome))
    }

    async fn snapshot_until_withdrawn(
        &self,
        request: &VolumeRequest,
        source: &SourceIdentity,
        snapshot_label: &SnapshotLabel,
    ) -> Result<crate::backup::CommittedSnapshot, BackupError> {
        let cancel = CancellationToken::new();
        let snapshot = self.orchestrator.snapshot(source, snapshot_label, &cancel);
        tokio::pin!(snapshot);
        tokio::select! {
            result = &mut snapshot => result,
            () = self.watch_withdrawal(request, &cancel) => snapshot.await,
        }
    }

    /// Whether the claim is gone, replaced or being deleted.
    async fn withdrawn(&self, request: &VolumeRequest) -> Result<bool, ClusterError> {
        let current = self
            .cluster
            .get_claim(&request.namespace, &request.name)
            .await?;
        Ok(!current.is_some_and(|claim| claim.uid == request.uid && !claim.deleting))
    }

    /// Treats a snapshot committed for a withdrawn claim like a deleted
    /// volume: removed under `Delete`, kept under `Retain`.
    async fn discard_committed(&self, request: &VolumeRequest, snapshot_label: &SnapshotLabel) {
        let policy = match self.provisioner.reclaim_policy(request).await {
            Ok(policy) => policy,
            Err(err) => {
                tracing::warn!(request = %request.key(), error = %err, "reclaim policy unavailable, keeping snapshot");
                return;
            }
        };
        if policy != ReclaimPolicy::Delete {
            return;
        }
        match self.orchestrator.store().remove(snapshot_label).await {
            Ok(_) => tracing::info!(label = %snapshot_label, "removed snapshot of withdrawn claim"),
            Err(err) => {
                tracing::warn!(label = %snapshot_label, error = %err, "failed to remove snapshot of withdrawn claim");
            }
        }
    }

    async fn watch_withdrawal(&self, request: &VolumeRequest, cancel: &CancellationToken) {
        loop {
            tokio::time::sleep(self.withdrawal_poll).await;
            match self.cluster.get_claim(&request.namespace, &request.name).await {
                Ok(Some(current)) if current.uid == request.uid && !current.deleting => {}
                Ok(_) => break,
                Err(err) => {
                    tracing::debug!(request = %request.key(), error = %err, "claim check failed");
                }
            }
        }
        cancel.cancel();
    }

    async fn record_error(&self, request: &VolumeRequest, message: Option<&str>) {
        if let Err(err) = self
            .cluster
            .annotate_claim(
                &request.namespace,
                &request.name,
                annotations::LAST_ERROR,
                message,
            )
            .await
        {
            tracing::warn!(request = %request.key(), error = %err, "failed to update last-error annotation");
        }
    }

    /// Handles a published volume that is not being deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Cluster`] when deleting a failed volume
    /// fails.
    pub async fn apply_volume(&self, volume: &VolumeRecord) -> Result<VolumeOutcome, ReconcileError> {
        if !is_managed(volume) {
            return Ok(VolumeOutcome::Unmanaged);
        }
        if !self.cleanup.owns(volume) {
            return Ok(VolumeOutcome::NotOnThisNode);
        }
        if self.cleanup.handle_failed(volume).await? {
            return Ok(VolumeOutcome::FailedDeleted);
        }
        Ok(VolumeOutcome::Healthy)
    }

    /// Runs cleanup for a volume being deleted. Never fails, so the
    /// finalizer is always released afterwards.
    pub async fn cleanup_volume(&self, volume: &VolumeRecord) -> CleanupOutcome {
        self.cleanup.finalize(volume).await
    }
}

fn is_managed(volume: &VolumeRecord) -> bool {
    volume.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

#[cfg(test)]
mod tests;
