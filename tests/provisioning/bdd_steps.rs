//! BDD step definitions for claim provisioning.

use pg_reflinker::model::annotations;
use pg_reflinker::test_support::request_for;
use rstest_bdd_macros::{given, then, when};

use crate::node_context::{NodeContext, ReconcileResult, StepError};

#[given("a claim \"{name}\" in namespace \"{namespace}\" with uid \"{uid}\" cloning \"{source}\"")]
fn claim_cloning(
    mut node_context: NodeContext,
    name: String,
    namespace: String,
    uid: String,
    source: String,
) -> NodeContext {
    node_context.request = Some(request_for(&namespace, &name, Some(&uid), None, &source));
    node_context
}

#[given("the copy succeeds")]
fn copy_succeeds(node_context: NodeContext) -> NodeContext {
    node_context.harness().runner.push_copy();
    node_context
}

#[given("the copy fails midway")]
fn copy_fails_midway(node_context: NodeContext) -> NodeContext {
    node_context.harness().runner.push_partial_copy_failure();
    node_context
}

#[when("the claim is reconciled")]
fn claim_reconciled(mut node_context: NodeContext) -> NodeContext {
    node_context.reconcile();
    node_context
}

#[then("the claim is published")]
fn claim_published(node_context: &NodeContext) -> Result<(), StepError> {
    node_context.published_volume().map(drop)
}

#[then("one volume is pinned to claim \"{claim}\"")]
fn volume_pinned(node_context: &NodeContext, claim: String) -> Result<(), StepError> {
    let volume = node_context.only_volume()?;
    let pinned = volume
        .claim
        .map(|reference| format!("{}/{}", reference.namespace, reference.name));
    if pinned.as_deref() == Some(claim.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "volume {} is pinned to {pinned:?}",
            volume.name
        )))
    }
}

#[then("the volume records source cluster \"{cluster}\" and snapshot \"{label}\"")]
fn volume_records_source(
    node_context: &NodeContext,
    cluster: String,
    label: String,
) -> Result<(), StepError> {
    let volume = node_context.only_volume()?;
    let recorded = (
        volume.annotation(annotations::SOURCE_CLUSTER),
        volume.annotation(annotations::SNAPSHOT),
    );
    if recorded == (Some(cluster.as_str()), Some(label.as_str())) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "volume {} records {recorded:?}",
            volume.name
        )))
    }
}

#[then("the snapshot directory \"{label}\" is committed")]
fn snapshot_committed(node_context: &NodeContext, label: String) -> Result<(), StepError> {
    let directory = node_context.harness().snapshot_dir(&label);
    if !directory.join("backup_label").is_file() {
        return Err(StepError::Assertion(format!(
            "{directory} has no backup_label"
        )));
    }
    if directory.join("postmaster.pid").exists() {
        return Err(StepError::Assertion(format!(
            "{directory} still holds postmaster.pid"
        )));
    }
    Ok(())
}

#[then("the database ran {count:u32} backup")]
fn database_backups(node_context: &NodeContext, count: u32) -> Result<(), StepError> {
    let started = node_context.harness().database.start_calls();
    if started == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} backups, database saw {started}"
        )))
    }
}

#[then("the reconcile fails and will be retried")]
fn reconcile_fails_transiently(node_context: &NodeContext) -> Result<(), StepError> {
    expect_failure(node_context, true)
}

#[then("the reconcile fails and waits for a change")]
fn reconcile_fails_permanently(node_context: &NodeContext) -> Result<(), StepError> {
    expect_failure(node_context, false)
}

fn expect_failure(node_context: &NodeContext, expected: bool) -> Result<(), StepError> {
    match node_context.last_result()? {
        ReconcileResult::Failure { transient, message }
            if *transient == expected && !message.is_empty() =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected a failure with transient={expected}, got {other:?}"
        ))),
    }
}

#[then("no volume is published")]
fn no_volume_published(node_context: &NodeContext) -> Result<(), StepError> {
    let volumes = node_context.harness().cluster.published_volumes();
    if volumes.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected volumes: {:?}",
            volumes.iter().map(|volume| &volume.name).collect::<Vec<_>>()
        )))
    }
}

#[then("the database is not left in backup mode")]
fn database_not_in_backup(node_context: &NodeContext) -> Result<(), StepError> {
    let database = &node_context.harness().database;
    if database.in_backup() || database.stop_calls() != database.start_calls() {
        return Err(StepError::Assertion(format!(
            "backup left open: {} started, {} stopped",
            database.start_calls(),
            database.stop_calls()
        )));
    }
    Ok(())
}

#[then("no snapshot directory \"{label}\" remains")]
fn no_snapshot_directory(node_context: &NodeContext, label: String) -> Result<(), StepError> {
    let directory = node_context.harness().snapshot_dir(&label);
    if directory.exists() {
        Err(StepError::Assertion(format!("{directory} was left behind")))
    } else {
        Ok(())
    }
}
