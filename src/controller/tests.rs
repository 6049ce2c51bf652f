//! Unit tests for claim and volume reconciliation.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::model::StorageClassRecord;
use crate::provisioner::ProvisionError;
use crate::test_support::{NodeHarness, SourceFixture, request_for};

struct Node {
    _temp: TempDir,
    harness: NodeHarness,
}

fn node_with(configure: impl FnOnce(&mut ReflinkerConfig)) -> Node {
    let temp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
    let mut config = crate::test_support::config_for_node("node-a");
    config.host_root = root.to_string();
    configure(&mut config);
    let harness = NodeHarness::with_config(config).expect("harness");
    harness.seed(&SourceFixture::default()).expect("seed source");
    Node {
        _temp: temp,
        harness,
    }
}

#[fixture]
fn node() -> Node {
    node_with(|config| config.namespace_path = String::from("db-ns1"))
}

fn apps_request() -> VolumeRequest {
    request_for("apps", "r1", Some("abc-1"), None, "pg-xyz-1")
}

async fn publish(node: &Node, request: &VolumeRequest) -> RequestOutcome {
    node.harness.cluster.insert_claim(request.clone());
    node.harness.runner.push_copy();
    node.harness
        .reconciler
        .reconcile_request(request)
        .await
        .expect("reconcile")
}

#[rstest]
#[tokio::test]
async fn search_path_resolves_source_in_other_namespace(node: Node) {
    let outcome = publish(&node, &apps_request()).await;

    assert!(matches!(outcome, RequestOutcome::Published(PublishOutcome::Created(_))));
    let volume = node
        .harness
        .cluster
        .volume("pg-reflinker-abc-1")
        .expect("volume published");
    assert_eq!(volume.annotation(annotations::SOURCE_CLUSTER), Some("db-ns1/pg-xyz"));
    assert_eq!(volume.annotation(annotations::SNAPSHOT), Some("abc-1"));
    assert_eq!(volume.annotation(annotations::NODE), Some("node-a"));
    let claim = volume.claim.expect("claim reference");
    assert_eq!((claim.namespace.as_str(), claim.uid.as_deref()), ("apps", Some("abc-1")));
    assert!(node.harness.snapshot_dir("abc-1").join("backup_label").exists());
    assert!(!node.harness.snapshot_dir("abc-1").join("postmaster.pid").exists());
}

#[rstest]
#[tokio::test]
async fn reconciling_again_publishes_nothing_new(node: Node) {
    let request = apps_request();
    publish(&node, &request).await;

    let again = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect("second reconcile");

    assert_eq!(
        again,
        RequestOutcome::AlreadyPublished {
            volume: String::from("pg-reflinker-abc-1")
        }
    );
    assert_eq!(node.harness.database.start_calls(), 1);
    assert_eq!(node.harness.cluster.published_volumes().len(), 1);
}

#[rstest]
#[case::other_class(|r: &mut VolumeRequest| r.storage_class = Some(String::from("standard")), IgnoreReason::OtherStorageClass)]
#[case::deleting(|r: &mut VolumeRequest| r.deleting = true, IgnoreReason::Deleting)]
#[case::bound(|r: &mut VolumeRequest| r.volume_name = Some(String::from("pv-1")), IgnoreReason::Bound)]
#[tokio::test]
async fn claims_needing_no_work_are_ignored(
    node: Node,
    #[case] mutate: fn(&mut VolumeRequest),
    #[case] reason: IgnoreReason,
) {
    let mut request = apps_request();
    mutate(&mut request);

    let outcome = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect("reconcile");

    assert_eq!(outcome, RequestOutcome::Ignored(reason));
    assert_eq!(node.harness.database.connect_calls(), 0);
}

#[tokio::test]
async fn source_on_other_node_is_left_to_that_node() {
    let node = node_with(|config| config.node_name = String::from("node-b"));
    let request = request_for("db-ns1", "r1", Some("abc-1"), None, "pg-xyz-1");

    let outcome = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect("reconcile");

    assert_eq!(
        outcome,
        RequestOutcome::NotLocal {
            node: String::from("node-a")
        }
    );
    assert_eq!(node.harness.database.connect_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn missing_credentials_are_reported_then_cleared(node: Node) {
    let request = apps_request();
    node.harness.cluster.insert_claim(request.clone());
    node.harness.cluster.remove_secret("db-ns1", "pg-xyz-replication");

    let err = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect_err("credentials missing");
    assert!(err.is_transient());
    let stored = node.harness.cluster.claim("apps", "r1").expect("claim");
    assert!(stored.annotations.contains_key(annotations::LAST_ERROR));

    crate::test_support::seed_source(&node.harness.cluster, &SourceFixture::default());
    node.harness.runner.push_copy();
    node.harness
        .reconciler
        .reconcile_request(&stored)
        .await
        .expect("retry succeeds");
    let cleared = node.harness.cluster.claim("apps", "r1").expect("claim");
    assert!(!cleared.annotations.contains_key(annotations::LAST_ERROR));
}

#[rstest]
#[tokio::test]
async fn withdrawn_claim_aborts_snapshot_and_publishes_nothing(node: Node) {
    let request = apps_request();
    node.harness.cluster.insert_claim(request.clone());
    node.harness.runner.push_hang();

    let withdraw = async {
        node.harness.database.wait_until_in_backup().await;
        let mut deleting = request.clone();
        deleting.deleting = true;
        node.harness.cluster.insert_claim(deleting);
    };
    let (outcome, ()) = tokio::join!(node.harness.reconciler.reconcile_request(&request), withdraw);

    assert!(matches!(outcome.expect("reconcile"), RequestOutcome::Withdrawn { .. }));
    assert_eq!(node.harness.database.stop_calls(), 1);
    assert!(!node.harness.database.in_backup());
    assert!(node.harness.cluster.published_volumes().is_empty());
    assert!(!node.harness.snapshot_dir("abc-1").exists());
}

#[rstest]
#[tokio::test]
async fn failed_volume_is_deleted_and_cleanup_removes_data(node: Node) {
    node.harness.cluster.insert_storage_class(StorageClassRecord {
        name: String::from("pg-reflinker"),
        reclaim_policy: Some(String::from("Delete")),
    });
    publish(&node, &apps_request()).await;
    node.harness
        .cluster
        .set_volume_phase("pg-reflinker-abc-1", "Failed");
    let failed = node
        .harness
        .cluster
        .volume("pg-reflinker-abc-1")
        .expect("volume");

    let outcome = node.harness.reconciler.apply_volume(&failed).await.expect("apply");
    assert_eq!(outcome, VolumeOutcome::FailedDeleted);

    let deleting = node
        .harness
        .cluster
        .volume("pg-reflinker-abc-1")
        .expect("volume awaiting finalizer");
    let cleaned = node.harness.reconciler.cleanup_volume(&deleting).await;
    assert!(matches!(cleaned, CleanupOutcome::Removed { .. }));
    assert!(!node.harness.snapshot_dir("abc-1").exists());
}

#[rstest]
#[tokio::test]
async fn unmanaged_volume_is_ignored(node: Node) {
    let volume = VolumeRecord {
        name: String::from("pv-other"),
        phase: Some(String::from("Failed")),
        ..VolumeRecord::default()
    };
    assert!(!node.harness.reconciler.owns_volume(&volume));
    let outcome = node.harness.reconciler.apply_volume(&volume).await.expect("apply");
    assert_eq!(outcome, VolumeOutcome::Unmanaged);
    assert_eq!(node.harness.cluster.delete_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn existing_volume_from_other_source_is_a_conflict(node: Node) {
    let request = apps_request();
    node.harness.cluster.insert_claim(request.clone());
    node.harness.cluster.insert_volume(VolumeRecord {
        name: String::from("pg-reflinker-abc-1"),
        labels: BTreeMap::from([(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned())]),
        annotations: BTreeMap::from([
            (annotations::SOURCE_CLUSTER.to_owned(), String::from("other-ns/pg-other")),
            (annotations::SNAPSHOT.to_owned(), String::from("abc-1")),
        ]),
        ..VolumeRecord::default()
    });

    let err = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect_err("conflict");

    assert!(
        matches!(err, ReconcileError::Provision(ProvisionError::Conflict { .. })),
        "{err:?}"
    );
    assert!(!err.is_transient());
    let stored = node.harness.cluster.claim("apps", "r1").expect("claim");
    assert!(stored.annotations.contains_key(annotations::LAST_ERROR));
    assert_eq!(node.harness.database.start_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn missing_capacity_is_refused_before_any_backup(node: Node) {
    let mut request = apps_request();
    request.capacity = None;
    node.harness.cluster.insert_claim(request.clone());

    let err = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect_err("capacity required");

    assert!(
        matches!(err, ReconcileError::Provision(ProvisionError::Invalid { .. })),
        "{err:?}"
    );
    assert_eq!(node.harness.database.connect_calls(), 0);
    assert!(!node.harness.snapshot_dir("abc-1").exists());
}

#[rstest]
#[case::delete(Some("Delete"))]
#[case::retain(None)]
#[tokio::test]
async fn claim_gone_when_snapshot_commits_publishes_nothing(
    node: Node,
    #[case] policy: Option<&str>,
) {
    if let Some(reclaim) = policy {
        node.harness.cluster.insert_storage_class(StorageClassRecord {
            name: String::from("pg-reflinker"),
            reclaim_policy: Some(reclaim.to_owned()),
        });
    }
    node.harness.runner.push_copy();

    let outcome = node
        .harness
        .reconciler
        .reconcile_request(&apps_request())
        .await
        .expect("reconcile");

    assert!(matches!(outcome, RequestOutcome::Withdrawn { .. }), "{outcome:?}");
    assert!(node.harness.cluster.published_volumes().is_empty());
    assert!(!node.harness.database.in_backup());
    if policy.is_some() {
        assert!(!node.harness.snapshot_dir("abc-1").exists());
    }
}

#[rstest]
#[tokio::test]
async fn unbound_source_volume_is_retried(node: Node) {
    let request = apps_request();
    node.harness.cluster.insert_claim(request.clone());
    let mut source_claim = node
        .harness
        .cluster
        .claim("db-ns1", "pg-xyz-1")
        .expect("source claim");
    source_claim.volume_name = None;
    node.harness.cluster.insert_claim(source_claim);

    let err = node
        .harness
        .reconciler
        .reconcile_request(&request)
        .await
        .expect_err("source not bound");

    assert!(err.is_transient(), "{err}");
    assert_eq!(node.harness.database.connect_calls(), 0);
}
