//! `kube` controller wiring for the live cluster.

use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::finalizer::{Error as FinalizerError, Event as FinalizerEvent, finalizer};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;

use super::Reconciler;
use crate::backup::{BackupDriver, PostgresConnector, ReflinkCopier, SnapshotStore, StoreError};
use crate::cluster::{ClusterError, KubeCluster, claim_to_request, volume_to_record};
use crate::command::ProcessCommandRunner;
use crate::config::{ConfigError, ReflinkerConfig};
use crate::error::ReconcileError;
use crate::model::{CLEANUP_FINALIZER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::orchestrator::SnapshotOrchestrator;
use crate::retry::{Backoff, FailureTracker};

type LiveReconciler = Reconciler<KubeCluster, PostgresConnector, ProcessCommandRunner>;

/// Errors that prevent the controllers from starting.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Configuration is incomplete or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No Kubernetes client could be built.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// The destination root cannot be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Context {
    client: Client,
    reconciler: LiveReconciler,
    failures: FailureTracker,
    backoff: Backoff,
}

/// Runs the claim and volume controllers until a termination signal.
///
/// # Errors
///
/// Returns [`ControllerError`] when configuration, the Kubernetes client or
/// the destination root is unusable.
pub async fn run(config: &ReflinkerConfig) -> Result<(), ControllerError> {
    config.validate()?;
    let cluster = Arc::new(KubeCluster::try_default().await?);
    let client = cluster.client();

    let store = SnapshotStore::open(
        &config.destination_root(),
        &config.host_view(&config.destination_root),
    )?;
    let driver = BackupDriver::new(
        ReflinkCopier::new(ProcessCommandRunner, config.cp_bin.clone()),
        store,
        config.backup_timeout(),
    );
    let connector = PostgresConnector::new(
        config.database_user.clone(),
        config.database_name.clone(),
        config.database_port,
        config.connect_attempts,
    );
    let orchestrator =
        SnapshotOrchestrator::new(connector, driver, Utf8PathBuf::from(&config.host_root));
    let context = Arc::new(Context {
        client: client.clone(),
        reconciler: Reconciler::new(Arc::clone(&cluster), orchestrator, config)?,
        failures: FailureTracker::new(),
        backoff: config.requeue_backoff(),
    });

    let claims = Controller::new(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .with_config(ControllerConfig::default().concurrency(config.workers))
    .shutdown_on_signal()
    .run(reconcile_claim, claim_error_policy, Arc::clone(&context))
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => tracing::debug!(claim = %object, "claim reconciled"),
            Err(err) => tracing::debug!(error = %err, "claim reconcile failed"),
        }
    });

    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    let volumes = Controller::new(
        Api::<PersistentVolume>::all(client),
        watcher::Config::default().labels(&selector),
    )
    .with_config(ControllerConfig::default().concurrency(config.workers))
    .shutdown_on_signal()
    .run(reconcile_volume, volume_error_policy, context)
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => tracing::debug!(volume = %object, "volume reconciled"),
            Err(err) => tracing::debug!(error = %err, "volume reconcile failed"),
        }
    });

    tracing::info!(
        node = %config.node_name,
        storage_class = %config.storage_class_name,
        workers = config.workers,
        "controllers started"
    );
    tokio::join!(claims, volumes);
    tracing::info!("controllers stopped");
    Ok(())
}

async fn reconcile_claim(
    claim: Arc<PersistentVolumeClaim>,
    context: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let request = claim_to_request(&claim);
    let outcome = context.reconciler.reconcile_request(&request).await?;
    context.failures.reset(&request.key());
    tracing::debug!(request = %request.key(), ?outcome, "claim handled");
    Ok(Action::await_change())
}

fn claim_error_policy(
    claim: Arc<PersistentVolumeClaim>,
    err: &ReconcileError,
    context: Arc<Context>,
) -> Action {
    let key = format!(
        "{}/{}",
        claim.namespace().unwrap_or_default(),
        claim.name_any()
    );
    requeue_action(&context, &key, err)
}

async fn reconcile_volume(
    volume: Arc<PersistentVolume>,
    context: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let record = volume_to_record(&volume);
    if !context.reconciler.owns_volume(&record) {
        return Ok(Action::await_change());
    }
    let api: Api<PersistentVolume> = Api::all(context.client.clone());
    let reconciler = &context.reconciler;
    let action = finalizer(&api, CLEANUP_FINALIZER, volume, |event| async move {
        match event {
            FinalizerEvent::Apply(current) => {
                let outcome = reconciler.apply_volume(&volume_to_record(&current)).await?;
                tracing::debug!(volume = %current.name_any(), ?outcome, "volume handled");
            }
            FinalizerEvent::Cleanup(current) => {
                reconciler.cleanup_volume(&volume_to_record(&current)).await;
            }
        }
        Ok::<Action, ReconcileError>(Action::await_change())
    })
    .await
    .map_err(unwrap_finalizer_error)?;
    context.failures.reset(&record.name);
    Ok(action)
}

fn volume_error_policy(
    volume: Arc<PersistentVolume>,
    err: &ReconcileError,
    context: Arc<Context>,
) -> Action {
    requeue_action(&context, &volume.name_any(), err)
}

fn unwrap_finalizer_error(err: FinalizerError<ReconcileError>) -> ReconcileError {
    match err {
        FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
        other => ReconcileError::Cluster(ClusterError::Api {
            message: other.to_string(),
        }),
    }
}

fn requeue_action(context: &Context, key: &str, err: &ReconcileError) -> Action {
    if err.is_transient() {
        let attempt = context.failures.record_failure(key);
        let delay = context.backoff.delay(attempt);
        tracing::warn!(object = key, error = %err, ?delay, "reconcile failed, requeueing");
        Action::requeue(delay)
    } else {
        context.failures.reset(key);
        tracing::error!(object = key, error = %err, "reconcile failed, waiting for a change");
        Action::await_change()
    }
}
