//! BDD step definitions for cleanup of published volumes.

use pg_reflinker::cluster::ClusterApi;
use pg_reflinker::model::StorageClassRecord;
use pg_reflinker::test_support::request_for;
use pg_reflinker::{CleanupOutcome, VolumeOutcome};
use rstest_bdd_macros::{given, then, when};

use crate::node_context::{NodeContext, StepError};

#[given("the storage class reclaim policy is \"{policy}\"")]
fn reclaim_policy(node_context: NodeContext, policy: String) -> NodeContext {
    let name = node_context.harness().config.storage_class_name.clone();
    node_context
        .harness()
        .cluster
        .insert_storage_class(StorageClassRecord {
            name,
            reclaim_policy: Some(policy),
        });
    node_context
}

#[given("a published clone for claim \"{name}\" with uid \"{uid}\"")]
fn published_clone(
    mut node_context: NodeContext,
    name: String,
    uid: String,
) -> Result<NodeContext, StepError> {
    node_context.request = Some(request_for("apps", &name, Some(&uid), None, "pg-xyz-1"));
    node_context.harness().runner.push_copy();
    node_context.reconcile();
    node_context.published_volume()?;
    Ok(node_context)
}

#[when("the volume is deleted")]
fn volume_deleted(node_context: NodeContext) -> Result<NodeContext, StepError> {
    let name = node_context.only_volume()?.name;
    node_context
        .block_on(node_context.harness().cluster.delete_volume(&name))
        .map_err(|err| StepError::Setup(err.to_string()))?;
    finish_deletion(&node_context, &name)?;
    Ok(node_context)
}

#[when("the volume reports the Failed phase")]
fn volume_failed(node_context: NodeContext) -> Result<NodeContext, StepError> {
    let name = node_context.only_volume()?.name;
    let cluster = &node_context.harness().cluster;
    cluster.set_volume_phase(&name, "Failed");
    let failed = cluster
        .volume(&name)
        .ok_or_else(|| StepError::Assertion(format!("volume {name} vanished")))?;
    let outcome = node_context
        .block_on(node_context.harness().reconciler.apply_volume(&failed))
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if outcome != VolumeOutcome::FailedDeleted {
        return Err(StepError::Assertion(format!(
            "failed volume was not deleted: {outcome:?}"
        )));
    }
    finish_deletion(&node_context, &name)?;
    Ok(node_context)
}

/// Runs cleanup for a volume awaiting its finalizer, then lets deletion
/// complete.
fn finish_deletion(node_context: &NodeContext, name: &str) -> Result<(), StepError> {
    let cluster = &node_context.harness().cluster;
    let deleting = cluster
        .volume(name)
        .filter(|volume| volume.deleting)
        .ok_or_else(|| StepError::Assertion(format!("volume {name} is not awaiting cleanup")))?;
    let outcome = node_context.block_on(node_context.harness().reconciler.cleanup_volume(&deleting));
    if let CleanupOutcome::Failed { message } = outcome {
        return Err(StepError::Assertion(format!("cleanup failed: {message}")));
    }
    cluster.release_finalizers(name);
    Ok(())
}

#[then("the snapshot directory \"{label}\" is removed")]
fn snapshot_removed(node_context: &NodeContext, label: String) -> Result<(), StepError> {
    let directory = node_context.harness().snapshot_dir(&label);
    if directory.exists() {
        Err(StepError::Assertion(format!("{directory} still exists")))
    } else {
        Ok(())
    }
}

#[then("the snapshot directory \"{label}\" is kept")]
fn snapshot_kept(node_context: &NodeContext, label: String) -> Result<(), StepError> {
    let directory = node_context.harness().snapshot_dir(&label);
    if directory.join("backup_label").is_file() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{directory} was removed")))
    }
}

#[then("the volume is gone")]
fn volume_gone(node_context: &NodeContext) -> Result<(), StepError> {
    let remaining = node_context.harness().cluster.published_volumes();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "volumes remain: {:?}",
            remaining.iter().map(|volume| &volume.name).collect::<Vec<_>>()
        )))
    }
}
