//! [`ClusterApi`] implementation backed by a `kube` client.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, LocalVolumeSource, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec, Pod, Secret, VolumeNodeAffinity,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use super::{ClusterApi, ClusterError, ClusterFuture};
use crate::model::{
    CLEANUP_FINALIZER, ClaimReference, DataSourceRef, HOSTNAME_TOPOLOGY_KEY, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, OwnerReference, PodRecord, PublishedVolume, StorageClassRecord,
    VolumeRecord, VolumeRequest, VolumeSourceKind, cnpg,
};

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the in-cluster or kubeconfig environment.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Api`] when no configuration can be inferred.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(api_error)?;
        Ok(Self::new(client))
    }

    /// Returns the underlying client for the controller runtime.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn api_error(err: kube::Error) -> ClusterError {
    ClusterError::Api {
        message: err.to_string(),
    }
}

/// Converts a claim into a [`VolumeRequest`].
#[must_use]
pub fn claim_to_request(claim: &PersistentVolumeClaim) -> VolumeRequest {
    let spec = claim.spec.clone().unwrap_or_default();
    let data_source = spec
        .data_source_ref
        .map(|reference| DataSourceRef {
            kind: reference.kind,
            namespace: reference.namespace,
            name: reference.name,
        })
        .or_else(|| {
            spec.data_source.map(|reference| DataSourceRef {
                kind: reference.kind,
                namespace: None,
                name: reference.name,
            })
        });
    let capacity = spec
        .resources
        .and_then(|resources| resources.requests)
        .and_then(|requests| requests.get("storage").map(|quantity| quantity.0.clone()));
    let owner_references = claim
        .owner_references()
        .iter()
        .map(|owner| OwnerReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        })
        .collect();

    VolumeRequest {
        namespace: claim.namespace().unwrap_or_default(),
        name: claim.name_any(),
        uid: claim.uid(),
        storage_class: spec.storage_class_name,
        capacity,
        data_source,
        volume_name: spec.volume_name.filter(|name| !name.is_empty()),
        annotations: claim.annotations().clone(),
        owner_references,
        deleting: claim.metadata.deletion_timestamp.is_some(),
    }
}

/// Converts a persistent volume into a [`VolumeRecord`].
#[must_use]
pub fn volume_to_record(volume: &PersistentVolume) -> VolumeRecord {
    let spec = volume.spec.clone().unwrap_or_default();
    let path = spec
        .local
        .map(|local| local.path)
        .or_else(|| spec.host_path.map(|host_path| host_path.path));
    let claim = spec.claim_ref.and_then(|reference| {
        Some(ClaimReference {
            namespace: reference.namespace?,
            name: reference.name?,
            uid: reference.uid,
        })
    });

    VolumeRecord {
        name: volume.name_any(),
        labels: volume.labels().clone(),
        annotations: volume.annotations().clone(),
        phase: volume.status.as_ref().and_then(|status| status.phase.clone()),
        reclaim_policy: spec.persistent_volume_reclaim_policy,
        path,
        claim,
        finalizers: volume.finalizers().to_vec(),
        deleting: volume.metadata.deletion_timestamp.is_some(),
    }
}

fn pod_to_record(pod: &Pod) -> PodRecord {
    let status = pod.status.clone().unwrap_or_default();
    let ready = status.conditions.unwrap_or_default().iter().any(|condition| {
        condition.type_ == "Ready" && condition.status == "True"
    });
    let spec = pod.spec.clone().unwrap_or_default();
    let image = spec
        .containers
        .iter()
        .find(|container| container.name == cnpg::POSTGRES_CONTAINER)
        .and_then(|container| container.image.clone());

    PodRecord {
        name: pod.name_any(),
        node_name: spec.node_name,
        pod_ip: status.pod_ip,
        ready,
        annotations: pod.annotations().clone(),
        image,
    }
}

/// Renders the persistent volume object for a committed snapshot.
#[must_use]
pub fn published_volume_object(volume: &PublishedVolume) -> PersistentVolume {
    let path = volume.destination_path.to_string();
    let (local, host_path) = match volume.source_kind {
        VolumeSourceKind::Local => (
            Some(LocalVolumeSource {
                path,
                fs_type: None,
            }),
            None,
        ),
        VolumeSourceKind::HostPath => (
            None,
            Some(HostPathVolumeSource {
                path,
                type_: Some(String::from("Directory")),
            }),
        ),
    };
    let node_affinity = VolumeNodeAffinity {
        required: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_TOPOLOGY_KEY.to_owned(),
                    operator: String::from("In"),
                    values: Some(vec![volume.node_name.clone()]),
                }]),
                match_fields: None,
            }],
        }),
    };
    let claim_ref = ObjectReference {
        api_version: Some(String::from("v1")),
        kind: Some(String::from("PersistentVolumeClaim")),
        namespace: Some(volume.claim.namespace.clone()),
        name: Some(volume.claim.name.clone()),
        uid: volume.claim.uid.clone(),
        ..ObjectReference::default()
    };

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name.clone()),
            labels: Some(volume.labels()),
            annotations: Some(volume.annotations()),
            finalizers: Some(vec![CLEANUP_FINALIZER.to_owned()]),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec![String::from("ReadWriteOnce")]),
            capacity: Some(BTreeMap::from([(
                String::from("storage"),
                Quantity(volume.capacity.clone()),
            )])),
            claim_ref: Some(claim_ref),
            host_path,
            local,
            node_affinity: Some(node_affinity),
            persistent_volume_reclaim_policy: Some(volume.reclaim_policy.as_str().to_owned()),
            storage_class_name: volume.storage_class.clone(),
            volume_mode: Some(String::from("Filesystem")),
            ..PersistentVolumeSpec::default()
        }),
        status: None,
    }
}

impl ClusterApi for KubeCluster {
    fn get_claim<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<VolumeRequest>> {
        Box::pin(async move {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client(), namespace);
            let claim = api.get_opt(name).await.map_err(api_error)?;
            Ok(claim.as_ref().map(claim_to_request))
        })
    }

    fn list_cluster_pods<'a>(
        &'a self,
        namespace: &'a str,
        cluster: &'a str,
    ) -> ClusterFuture<'a, Vec<PodRecord>> {
        Box::pin(async move {
            let api: Api<Pod> = Api::namespaced(self.client(), namespace);
            let selector = format!("{}={cluster}", cnpg::CLUSTER_LABEL);
            let pods = api
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(api_error)?;
            Ok(pods.items.iter().map(pod_to_record).collect())
        })
    }

    fn get_secret<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<BTreeMap<String, Vec<u8>>>> {
        Box::pin(async move {
            let api: Api<Secret> = Api::namespaced(self.client(), namespace);
            let secret = api.get_opt(name).await.map_err(api_error)?;
            Ok(secret.map(|found| {
                found
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, value.0))
                    .collect()
            }))
        })
    }

    fn get_storage_class<'a>(
        &'a self,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<StorageClassRecord>> {
        Box::pin(async move {
            let api: Api<StorageClass> = Api::all(self.client());
            let class = api.get_opt(name).await.map_err(api_error)?;
            Ok(class.map(|found| StorageClassRecord {
                name: found.name_any(),
                reclaim_policy: found.reclaim_policy,
            }))
        })
    }

    fn get_volume<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, Option<VolumeRecord>> {
        Box::pin(async move {
            let api: Api<PersistentVolume> = Api::all(self.client());
            let volume = api.get_opt(name).await.map_err(api_error)?;
            Ok(volume.as_ref().map(volume_to_record))
        })
    }

    fn list_published_volumes(&self) -> ClusterFuture<'_, Vec<VolumeRecord>> {
        Box::pin(async move {
            let api: Api<PersistentVolume> = Api::all(self.client());
            let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
            let volumes = api
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(api_error)?;
            Ok(volumes.items.iter().map(volume_to_record).collect())
        })
    }

    fn create_volume<'a>(&'a self, volume: &'a PublishedVolume) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let api: Api<PersistentVolume> = Api::all(self.client());
            let object = published_volume_object(volume);
            match api.create(&PostParams::default(), &object).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(response)) if response.code == HTTP_CONFLICT => {
                    Err(ClusterError::AlreadyExists {
                        kind: String::from("PersistentVolume"),
                        name: volume.name.clone(),
                    })
                }
                Err(err) => Err(api_error(err)),
            }
        })
    }

    fn delete_volume<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let api: Api<PersistentVolume> = Api::all(self.client());
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(response)) if response.code == HTTP_NOT_FOUND => Ok(()),
                Err(err) => Err(api_error(err)),
            }
        })
    }

    fn annotate_claim<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        key: &'a str,
        value: Option<&'a str>,
    ) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client(), namespace);
            let patch = json!({ "metadata": { "annotations": { key: value } } });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(api_error)?;
            Ok(())
        })
    }
}
