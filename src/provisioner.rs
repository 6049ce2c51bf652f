//! Volume publication.
//!
//! A volume is created only for a snapshot whose completion marker is on
//! disk, and only once per request: re-publishing finds the existing volume
//! and checks it describes the same snapshot of the same source.

use std::sync::Arc;

use thiserror::Error;

use crate::backup::{CommittedSnapshot, SnapshotStatus, SnapshotStore, StoreError};
use crate::cluster::{ClusterApi, ClusterError};
use crate::label::SnapshotLabel;
use crate::model::{
    PublishedVolume, ReclaimPolicy, SourceIdentity, VolumeRecord, VolumeRequest,
    VolumeSourceKind, annotations,
};

/// Errors raised while publishing a volume.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when the snapshot directory lacks its completion marker.
    #[error("snapshot {label} is not committed")]
    NotCommitted {
        /// Snapshot label.
        label: String,
    },
    /// Raised when the request cannot be turned into a volume.
    #[error("invalid request {request}: {message}")]
    Invalid {
        /// `namespace/name` of the request.
        request: String,
        /// What is missing.
        message: String,
    },
    /// Raised when a volume with the target name describes something else.
    #[error("volume {name} already exists for a different snapshot: {message}")]
    Conflict {
        /// Volume name.
        name: String,
        /// First mismatch found.
        message: String,
    },
    /// Raised when the marker cannot be checked.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Wrapper for cluster API failures.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl ProvisionError {
    /// Returns `true` when retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid { .. } | Self::Conflict { .. })
    }
}

/// Result of a successful publication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublishOutcome {
    /// A new volume was created.
    Created(PublishedVolume),
    /// A matching volume already existed.
    AlreadyPublished(PublishedVolume),
}

impl PublishOutcome {
    /// The volume that now represents the snapshot.
    #[must_use]
    pub const fn volume(&self) -> &PublishedVolume {
        match self {
            Self::Created(volume) | Self::AlreadyPublished(volume) => volume,
        }
    }
}

/// Creates volumes for committed snapshots.
#[derive(Debug)]
pub struct VolumeProvisioner<C> {
    cluster: Arc<C>,
    source_kind: VolumeSourceKind,
}

impl<C: ClusterApi> VolumeProvisioner<C> {
    /// Creates a provisioner writing `source_kind` volumes.
    #[must_use]
    pub const fn new(cluster: Arc<C>, source_kind: VolumeSourceKind) -> Self {
        Self {
            cluster,
            source_kind,
        }
    }

    /// Publishes `snapshot` as a volume pre-bound to `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotCommitted`] when the marker is missing,
    /// [`ProvisionError::Conflict`] when the volume name is taken by another
    /// snapshot, and [`ProvisionError::Cluster`] on API failures.
    pub async fn publish(
        &self,
        request: &VolumeRequest,
        source: &SourceIdentity,
        snapshot: &CommittedSnapshot,
        store: &SnapshotStore,
    ) -> Result<PublishOutcome, ProvisionError> {
        if store.status(&snapshot.label)? != SnapshotStatus::Committed {
            return Err(ProvisionError::NotCommitted {
                label: snapshot.label.to_string(),
            });
        }
        let volume = self.volume_for(request, source, snapshot).await?;

        match self.cluster.create_volume(&volume).await {
            Ok(()) => {
                tracing::info!(
                    volume = %volume.name,
                    request = %request.key(),
                    reclaim = volume.reclaim_policy.as_str(),
                    "published volume"
                );
                Ok(PublishOutcome::Created(volume))
            }
            Err(ClusterError::AlreadyExists { .. }) => {
                let existing = self.cluster.get_volume(&volume.name).await?.ok_or_else(|| {
                    ClusterError::Api {
                        message: format!("volume {} vanished after conflict", volume.name),
                    }
                })?;
                ensure_same_snapshot(&existing, &volume)?;
                tracing::debug!(volume = %volume.name, "volume already published");
                Ok(PublishOutcome::AlreadyPublished(volume))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resolves the reclaim policy from the request's storage class,
    /// defaulting to `Retain`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the storage class cannot be read.
    pub async fn reclaim_policy(
        &self,
        request: &VolumeRequest,
    ) -> Result<ReclaimPolicy, ClusterError> {
        let Some(class_name) = request.storage_class.as_deref() else {
            return Ok(ReclaimPolicy::Retain);
        };
        let class = self.cluster.get_storage_class(class_name).await?;
        Ok(ReclaimPolicy::from_policy(
            class.as_ref().and_then(|found| found.reclaim_policy.as_deref()),
        ))
    }

    async fn volume_for(
        &self,
        request: &VolumeRequest,
        source: &SourceIdentity,
        snapshot: &CommittedSnapshot,
    ) -> Result<PublishedVolume, ProvisionError> {
        let capacity = requested_capacity(request)?.to_owned();
        let reclaim_policy = self.reclaim_policy(request).await?;
        Ok(PublishedVolume {
            name: PublishedVolume::name_for(&snapshot.label),
            label: snapshot.label.clone(),
            destination_path: snapshot.host_path.clone(),
            node_name: source.node_name.clone(),
            capacity,
            reclaim_policy,
            storage_class: request.storage_class.clone(),
            claim: request.claim_reference(),
            source_cluster: source.cluster_identity(),
            source_kind: self.source_kind,
        })
    }
}

/// What an existing volume must record to count as the same publication.
struct Expected<'a> {
    name: &'a str,
    label: &'a str,
    source_cluster: &'a str,
    claim_uid: Option<&'a str>,
}

/// Checks that a volume found under the target name describes `label` of
/// `source`, published for `request`.
///
/// # Errors
///
/// Returns [`ProvisionError::Conflict`] naming the first mismatch.
pub fn ensure_published_for(
    existing: &VolumeRecord,
    request: &VolumeRequest,
    source: &SourceIdentity,
    label: &SnapshotLabel,
) -> Result<(), ProvisionError> {
    let name = PublishedVolume::name_for(label);
    let source_cluster = source.cluster_identity();
    ensure_matches(
        existing,
        &Expected {
            name: &name,
            label: label.as_str(),
            source_cluster: &source_cluster,
            claim_uid: request.uid.as_deref(),
        },
    )
}

/// Rejects a request that names no capacity before any snapshot is taken.
///
/// # Errors
///
/// Returns [`ProvisionError::Invalid`] when the request has no capacity.
pub fn requested_capacity(request: &VolumeRequest) -> Result<&str, ProvisionError> {
    request
        .capacity
        .as_deref()
        .filter(|capacity| !capacity.trim().is_empty())
        .ok_or_else(|| ProvisionError::Invalid {
            request: request.key(),
            message: String::from("no storage capacity requested"),
        })
}

fn ensure_same_snapshot(
    existing: &VolumeRecord,
    wanted: &PublishedVolume,
) -> Result<(), ProvisionError> {
    ensure_matches(
        existing,
        &Expected {
            name: &wanted.name,
            label: wanted.label.as_str(),
            source_cluster: &wanted.source_cluster,
            claim_uid: wanted.claim.uid.as_deref(),
        },
    )
}

fn ensure_matches(existing: &VolumeRecord, wanted: &Expected<'_>) -> Result<(), ProvisionError> {
    let conflict = |message: String| ProvisionError::Conflict {
        name: wanted.name.to_owned(),
        message,
    };
    for (key, expected) in [
        (annotations::SNAPSHOT, wanted.label),
        (annotations::SOURCE_CLUSTER, wanted.source_cluster),
    ] {
        let found = existing.annotation(key);
        if found != Some(expected) {
            return Err(conflict(format!(
                "{key} is {}, expected {expected}",
                found.unwrap_or("unset")
            )));
        }
    }
    if let Some(claim) = &existing.claim
        && claim.uid.is_some()
        && claim.uid.as_deref() != wanted.claim_uid
    {
        return Err(conflict(format!(
            "bound to claim {}/{}",
            claim.namespace, claim.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::label::validate;
    use crate::model::{ClaimReference, StorageClassRecord};
    use crate::test_support::{FakeCluster, request_for, sample_source};
    use camino::{Utf8Path, Utf8PathBuf};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        cluster: Arc<FakeCluster>,
        store: SnapshotStore,
        provisioner: VolumeProvisioner<FakeCluster>,
        snapshot: CommittedSnapshot,
    }

    #[fixture]
    fn harness() -> Harness {
        let temp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
        let store =
            SnapshotStore::open(Utf8Path::new("/var/lib/pg-reflinker"), &root).expect("store");
        let label = validate("abc-1").expect("label");
        std::fs::create_dir_all(store.view_path(&label)).expect("mkdir");
        store.write_marker(&label, "LABEL: abc-1\n").expect("marker");
        let cluster = Arc::new(FakeCluster::new());
        Harness {
            _temp: temp,
            provisioner: VolumeProvisioner::new(Arc::clone(&cluster), VolumeSourceKind::Local),
            cluster,
            snapshot: CommittedSnapshot {
                host_path: store.host_path(&label),
                label,
                reused: false,
            },
            store,
        }
    }

    fn request() -> VolumeRequest {
        request_for("apps", "r1", Some("abc-1"), None, "pg-xyz-1")
    }

    #[rstest]
    #[tokio::test]
    async fn publishes_pinned_volume_with_retain_default(harness: Harness) {
        let outcome = harness
            .provisioner
            .publish(&request(), &sample_source(), &harness.snapshot, &harness.store)
            .await
            .expect("publish");

        assert!(matches!(outcome, PublishOutcome::Created(_)));
        let volume = harness
            .cluster
            .volume("pg-reflinker-abc-1")
            .expect("volume stored");
        assert_eq!(volume.reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(
            volume.claim,
            Some(ClaimReference {
                namespace: String::from("apps"),
                name: String::from("r1"),
                uid: Some(String::from("abc-1")),
            })
        );
        assert_eq!(
            volume.annotation(annotations::SOURCE_CLUSTER),
            Some("db-ns1/pg-xyz")
        );
        assert_eq!(volume.annotation(annotations::SNAPSHOT), Some("abc-1"));
        assert_eq!(
            volume.annotation(annotations::DESTINATION),
            Some("/var/lib/pg-reflinker/abc-1")
        );
    }

    #[rstest]
    #[tokio::test]
    async fn storage_class_delete_policy_is_copied(harness: Harness) {
        harness.cluster.insert_storage_class(StorageClassRecord {
            name: String::from("pg-reflinker"),
            reclaim_policy: Some(String::from("Delete")),
        });
        let outcome = harness
            .provisioner
            .publish(&request(), &sample_source(), &harness.snapshot, &harness.store)
            .await
            .expect("publish");
        assert_eq!(outcome.volume().reclaim_policy, ReclaimPolicy::Delete);
    }

    #[rstest]
    #[tokio::test]
    async fn republishing_same_snapshot_is_idempotent(harness: Harness) {
        for _ in 0..2 {
            harness
                .provisioner
                .publish(&request(), &sample_source(), &harness.snapshot, &harness.store)
                .await
                .expect("publish");
        }
        assert_eq!(harness.cluster.published_volumes().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn volume_from_other_source_is_conflict(harness: Harness) {
        harness
            .provisioner
            .publish(&request(), &sample_source(), &harness.snapshot, &harness.store)
            .await
            .expect("publish");
        let mut other = sample_source();
        other.cluster_name = String::from("pg-other");

        let err = harness
            .provisioner
            .publish(&request(), &other, &harness.snapshot, &harness.store)
            .await
            .expect_err("conflict");
        assert!(matches!(err, ProvisionError::Conflict { .. }), "{err:?}");
        assert!(!err.is_transient());
    }

    #[rstest]
    fn volume_for_another_claim_uid_is_conflict(harness: Harness) {
        let existing = VolumeRecord {
            name: String::from("pg-reflinker-abc-1"),
            annotations: BTreeMap::from([
                (annotations::SNAPSHOT.to_owned(), String::from("abc-1")),
                (annotations::SOURCE_CLUSTER.to_owned(), String::from("db-ns1/pg-xyz")),
            ]),
            claim: Some(ClaimReference {
                namespace: String::from("apps"),
                name: String::from("r1"),
                uid: Some(String::from("older-uid")),
            }),
            ..VolumeRecord::default()
        };

        let err = ensure_published_for(&existing, &request(), &sample_source(), &harness.snapshot.label)
            .expect_err("other claim");
        assert!(matches!(err, ProvisionError::Conflict { .. }), "{err:?}");

        let mut matching = existing;
        matching.claim = Some(request().claim_reference());
        ensure_published_for(&matching, &request(), &sample_source(), &harness.snapshot.label)
            .expect("same publication");
    }

    #[rstest]
    #[case(None)]
    #[case(Some("  "))]
    fn request_without_capacity_is_invalid(#[case] capacity: Option<&str>) {
        let mut unsized_request = request();
        unsized_request.capacity = capacity.map(str::to_owned);
        let err = requested_capacity(&unsized_request).expect_err("capacity required");
        assert!(matches!(err, ProvisionError::Invalid { .. }));
        assert!(!err.is_transient());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_marker_blocks_publication(harness: Harness) {
        std::fs::remove_file(harness.store.view_path(&harness.snapshot.label).join("backup_label"))
            .expect("remove marker");
        let err = harness
            .provisioner
            .publish(&request(), &sample_source(), &harness.snapshot, &harness.store)
            .await
            .expect_err("not committed");
        assert!(matches!(err, ProvisionError::NotCommitted { .. }));
        assert_eq!(harness.cluster.create_calls(), 0);
    }
}
