//! Domain records shared by the resolver, orchestrator, provisioner and
//! cleanup controller.
//!
//! These types mirror the parts of the Kubernetes objects the controller
//! reads and writes. The `cluster::kubernetes` module converts between them and the
//! `k8s-openapi` structs so the rest of the crate stays testable without an
//! API server.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;

use crate::label::SnapshotLabel;

/// Label key marking objects owned by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value stored under [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "pg-reflinker";

/// Finalizer placed on published volumes so deletion runs cleanup first.
pub const CLEANUP_FINALIZER: &str = "pg-reflinker/cleanup";

/// Prefix of every published volume name; the snapshot label follows it.
pub const VOLUME_NAME_PREFIX: &str = "pg-reflinker-";

/// Node label used for node affinity on published volumes.
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Annotation keys written on published volumes and requests.
pub mod annotations {
    /// `namespace/cluster` of the source database cluster.
    pub const SOURCE_CLUSTER: &str = "pg-reflinker/source-cluster-identity";
    /// Snapshot label (backup label and directory name).
    pub const SNAPSHOT: &str = "pg-reflinker/snapshot-identifier";
    /// Host path of the snapshot directory.
    pub const DESTINATION: &str = "pg-reflinker/destination-path";
    /// Node holding the snapshot directory.
    pub const NODE: &str = "pg-reflinker/node";
    /// Namespace of the originating request.
    pub const ORIGIN_NAMESPACE: &str = "pg-reflinker/origin-namespace";
    /// Name of the originating request.
    pub const ORIGIN_NAME: &str = "pg-reflinker/origin-name";
    /// Uid of the originating request.
    pub const ORIGIN_UID: &str = "pg-reflinker/origin-uid";
    /// Last reconcile failure, written on the request.
    pub const LAST_ERROR: &str = "pg-reflinker/last-error";
}

/// Conventions of the CloudNativePG operator that owns source clusters.
pub mod cnpg {
    /// API version of the owning `Cluster` resource.
    pub const CLUSTER_API_VERSION: &str = "postgresql.cnpg.io/v1";
    /// Kind of the owning resource.
    pub const CLUSTER_KIND: &str = "Cluster";
    /// Pod label naming the cluster.
    pub const CLUSTER_LABEL: &str = "cnpg.io/cluster";
    /// Annotation pairing an instance pod with its data volume.
    pub const NODE_SERIAL_ANNOTATION: &str = "cnpg.io/nodeSerial";
    /// Name of the database container in instance pods.
    pub const POSTGRES_CONTAINER: &str = "postgres";
    /// Suffix of the secret holding the CA bundle.
    pub const CA_SECRET_SUFFIX: &str = "-ca";
    /// Suffix of the secret holding the replication client certificate.
    pub const REPLICATION_SECRET_SUFFIX: &str = "-replication";
}

/// Reference from a request to the volume it should be cloned from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataSourceRef {
    /// Referenced kind; only `PersistentVolumeClaim` is served.
    pub kind: String,
    /// Optional namespace of the referenced claim.
    pub namespace: Option<String>,
    /// Name of the referenced claim.
    pub name: String,
}

/// Owner reference as recorded on a claim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnerReference {
    /// API group and version of the owner.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
}

/// A persistent volume claim, either the request being served or the source
/// claim it points at.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Claim namespace.
    pub namespace: String,
    /// Claim name.
    pub name: String,
    /// Server-assigned uid, absent only for objects not yet persisted.
    pub uid: Option<String>,
    /// Requested storage class.
    pub storage_class: Option<String>,
    /// Requested capacity as a Kubernetes quantity string.
    pub capacity: Option<String>,
    /// Source the claim should be cloned from.
    pub data_source: Option<DataSourceRef>,
    /// Name of the bound volume, once bound.
    pub volume_name: Option<String>,
    /// Claim annotations.
    pub annotations: BTreeMap<String, String>,
    /// Claim owner references.
    pub owner_references: Vec<OwnerReference>,
    /// Whether the claim carries a deletion timestamp.
    pub deleting: bool,
}

impl VolumeRequest {
    /// Returns `namespace/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Builds the claim reference that pins a volume to this request.
    #[must_use]
    pub fn claim_reference(&self) -> ClaimReference {
        ClaimReference {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Pod of a database cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PodRecord {
    /// Pod name.
    pub name: String,
    /// Node the pod is scheduled on.
    pub node_name: Option<String>,
    /// Pod IP address.
    pub pod_ip: Option<String>,
    /// Whether the `Ready` condition is true.
    pub ready: bool,
    /// Pod annotations.
    pub annotations: BTreeMap<String, String>,
    /// Image of the `postgres` container.
    pub image: Option<String>,
}

/// Binding from a volume to one specific claim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClaimReference {
    /// Claim namespace.
    pub namespace: String,
    /// Claim name.
    pub name: String,
    /// Claim uid.
    pub uid: Option<String>,
}

/// A persistent volume as observed in the cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRecord {
    /// Volume name.
    pub name: String,
    /// Volume labels.
    pub labels: BTreeMap<String, String>,
    /// Volume annotations.
    pub annotations: BTreeMap<String, String>,
    /// Status phase (`Bound`, `Released`, `Failed`, ...).
    pub phase: Option<String>,
    /// Reclaim policy recorded on the volume.
    pub reclaim_policy: Option<String>,
    /// Host path backing the volume (local or hostPath source).
    pub path: Option<String>,
    /// Claim the volume is bound or pre-bound to.
    pub claim: Option<ClaimReference>,
    /// Finalizers present on the volume.
    pub finalizers: Vec<String>,
    /// Whether the volume carries a deletion timestamp.
    pub deleting: bool,
}

impl VolumeRecord {
    /// Returns an annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Returns `true` when the volume reports the `Failed` phase.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.phase.as_deref() == Some("Failed")
    }
}

/// Disposition of snapshot data once the volume is released.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReclaimPolicy {
    /// Keep the snapshot directory.
    #[default]
    Retain,
    /// Remove the snapshot directory.
    Delete,
}

impl ReclaimPolicy {
    /// Maps a Kubernetes reclaim policy string; unknown or missing values
    /// fall back to [`ReclaimPolicy::Retain`].
    #[must_use]
    pub fn from_policy(value: Option<&str>) -> Self {
        match value {
            Some("Delete") => Self::Delete,
            _ => Self::Retain,
        }
    }

    /// Returns the Kubernetes spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retain => "Retain",
            Self::Delete => "Delete",
        }
    }
}

/// Storage class fields the provisioner reads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StorageClassRecord {
    /// Storage class name.
    pub name: String,
    /// Reclaim policy, when set.
    pub reclaim_policy: Option<String>,
}

/// How a published volume references its directory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum VolumeSourceKind {
    /// `local` volume with node affinity.
    #[default]
    Local,
    /// `hostPath` volume with node affinity.
    HostPath,
}

/// TLS material used to open a database session.
#[derive(Clone, Eq, PartialEq)]
pub struct DatabaseCredentials {
    /// CA bundle in PEM form.
    pub ca_pem: String,
    /// Client certificate in PEM form.
    pub cert_pem: String,
    /// Client private key in PEM form.
    pub key_pem: String,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DatabaseCredentials")
            .field("ca_pem", &format_args!("<{} bytes>", self.ca_pem.len()))
            .field("cert_pem", &format_args!("<{} bytes>", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Everything needed to snapshot one source database instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceIdentity {
    /// Namespace of the database cluster.
    pub cluster_namespace: String,
    /// Name of the database cluster.
    pub cluster_name: String,
    /// Name of the source claim.
    pub source_claim: String,
    /// Node running the selected instance.
    pub node_name: String,
    /// Name of the selected pod.
    pub pod_name: String,
    /// IP address used to reach the database.
    pub pod_ip: String,
    /// Secret holding the client certificate.
    pub client_secret: String,
    /// Secret holding the CA bundle.
    pub ca_secret: String,
    /// Database container image, when known.
    pub image: Option<String>,
    /// Host path of the live data directory.
    pub data_directory: Utf8PathBuf,
    /// Session credentials.
    pub credentials: DatabaseCredentials,
}

impl SourceIdentity {
    /// Returns `namespace/cluster`, the key used for mutual exclusion and the
    /// source-cluster annotation.
    #[must_use]
    pub fn cluster_identity(&self) -> String {
        format!("{}/{}", self.cluster_namespace, self.cluster_name)
    }
}

/// A volume ready to be created for a committed snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishedVolume {
    /// Volume name (`pg-reflinker-<label>`).
    pub name: String,
    /// Snapshot label.
    pub label: SnapshotLabel,
    /// Host path of the snapshot directory.
    pub destination_path: Utf8PathBuf,
    /// Node holding the snapshot directory.
    pub node_name: String,
    /// Capacity quantity copied from the request.
    pub capacity: String,
    /// Reclaim policy resolved from the storage class.
    pub reclaim_policy: ReclaimPolicy,
    /// Storage class copied from the request.
    pub storage_class: Option<String>,
    /// Claim the volume is pre-bound to.
    pub claim: ClaimReference,
    /// `namespace/cluster` of the source.
    pub source_cluster: String,
    /// Volume source flavour.
    pub source_kind: VolumeSourceKind,
}

impl PublishedVolume {
    /// Returns the volume name for a snapshot label.
    #[must_use]
    pub fn name_for(label: &SnapshotLabel) -> String {
        format!("{VOLUME_NAME_PREFIX}{label}")
    }

    /// Returns the annotations recorded on the volume.
    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert(
            annotations::SOURCE_CLUSTER.to_owned(),
            self.source_cluster.clone(),
        );
        values.insert(annotations::SNAPSHOT.to_owned(), self.label.to_string());
        values.insert(
            annotations::DESTINATION.to_owned(),
            self.destination_path.to_string(),
        );
        values.insert(annotations::NODE.to_owned(), self.node_name.clone());
        values.insert(
            annotations::ORIGIN_NAMESPACE.to_owned(),
            self.claim.namespace.clone(),
        );
        values.insert(annotations::ORIGIN_NAME.to_owned(), self.claim.name.clone());
        if let Some(uid) = &self.claim.uid {
            values.insert(annotations::ORIGIN_UID.to_owned(), uid.clone());
        }
        values
    }

    /// Returns the labels recorded on the volume.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned())])
    }
}
