//! Source resolution.
//!
//! Maps a volume request to the database instance whose data directory will
//! be cloned: the source claim, its owning CloudNativePG cluster, the Ready
//! pod serving that claim, the data directory on the node, and the TLS
//! material for a replication session.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::cluster::{ClusterApi, ClusterError};
use crate::model::{DatabaseCredentials, PodRecord, SourceIdentity, VolumeRequest, cnpg};

/// Kind of data source this controller serves.
pub const SUPPORTED_SOURCE_KIND: &str = "PersistentVolumeClaim";

const CA_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const KEY_KEY: &str = "tls.key";
const PEM_BEGIN: &str = "-----BEGIN ";

/// Errors raised while resolving a source.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Raised when the source claim exists in none of the searched namespaces.
    #[error("source claim {name} not found in namespaces [{}]", namespaces.join(", "))]
    NotFound {
        /// Source claim name.
        name: String,
        /// Namespaces searched, in order.
        namespaces: Vec<String>,
    },
    /// Raised when the request cannot describe a source at all.
    #[error("invalid request: {message}")]
    Invalid {
        /// What is wrong with the request.
        message: String,
    },
    /// Raised when the source claim cannot be mapped to a node-local
    /// database data directory.
    #[error("cannot resolve source {claim}: {message}")]
    SourceUnresolved {
        /// `namespace/name` of the source claim.
        claim: String,
        /// Reason resolution stopped.
        message: String,
    },
    /// Raised when the source claim has no volume yet, or its volume is
    /// missing. The database operator is expected to bind it shortly.
    #[error("source volume of {claim} is not available yet: {message}")]
    VolumePending {
        /// `namespace/name` of the source claim.
        claim: String,
        /// What is missing.
        message: String,
    },
    /// Raised when no Ready pod serves the source claim.
    #[error("no ready pod of cluster {cluster} serves node serial {serial}")]
    PodUnresolved {
        /// `namespace/cluster`.
        cluster: String,
        /// Node serial of the source claim.
        serial: String,
    },
    /// Raised when the session credentials are missing or malformed.
    #[error("credentials unavailable in secret {secret}: {message}")]
    AuthUnresolved {
        /// `namespace/name` of the secret.
        secret: String,
        /// What is missing.
        message: String,
    },
    /// Wrapper for cluster API failures.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl ResolveError {
    /// Returns `true` when retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid { .. } | Self::SourceUnresolved { .. })
    }
}

/// Resolves requests against the cluster API.
#[derive(Debug)]
pub struct SourceResolver<C> {
    cluster: Arc<C>,
    namespace_path: Vec<String>,
    pgdata_subdir: String,
    node_name: String,
}

impl<C: ClusterApi> SourceResolver<C> {
    /// Creates a resolver for the instance running on `node_name`.
    #[must_use]
    pub const fn new(
        cluster: Arc<C>,
        namespace_path: Vec<String>,
        pgdata_subdir: String,
        node_name: String,
    ) -> Self {
        Self {
            cluster,
            namespace_path,
            pgdata_subdir,
            node_name,
        }
    }

    /// Returns `true` when the source lives on this instance's node.
    #[must_use]
    pub fn is_local(&self, source: &SourceIdentity) -> bool {
        source.node_name == self.node_name
    }

    /// Namespaces searched for the source claim, in order.
    #[must_use]
    pub fn candidate_namespaces(&self, request: &VolumeRequest) -> Vec<String> {
        if let Some(explicit) = request
            .data_source
            .as_ref()
            .and_then(|source| source.namespace.clone())
            .filter(|namespace| !namespace.is_empty())
        {
            return vec![explicit];
        }
        let mut namespaces = vec![request.namespace.clone()];
        for namespace in &self.namespace_path {
            if !namespaces.contains(namespace) {
                namespaces.push(namespace.clone());
            }
        }
        namespaces
    }

    /// Resolves the source of `request`.
    ///
    /// # Errors
    ///
    /// Returns the [`ResolveError`] variant matching the first step that
    /// cannot complete.
    pub async fn resolve(&self, request: &VolumeRequest) -> Result<SourceIdentity, ResolveError> {
        let data_source = request
            .data_source
            .as_ref()
            .ok_or_else(|| ResolveError::Invalid {
                message: format!("{} has no data source", request.key()),
            })?;
        if data_source.kind != SUPPORTED_SOURCE_KIND {
            return Err(ResolveError::Invalid {
                message: format!(
                    "data source kind {} is not supported, expected {SUPPORTED_SOURCE_KIND}",
                    data_source.kind
                ),
            });
        }

        let source_claim = self.find_source_claim(request, &data_source.name).await?;
        let claim_key = source_claim.key();
        let cluster_name = owning_cluster(&source_claim)?;
        let serial = source_claim
            .annotations
            .get(cnpg::NODE_SERIAL_ANNOTATION)
            .cloned()
            .ok_or_else(|| ResolveError::SourceUnresolved {
                claim: claim_key.clone(),
                message: format!("missing {} annotation", cnpg::NODE_SERIAL_ANNOTATION),
            })?;

        let namespace = source_claim.namespace.clone();
        let pods = self
            .cluster
            .list_cluster_pods(&namespace, &cluster_name)
            .await?;
        let (pod, node_name, pod_ip) =
            select_pod(&pods, &serial).ok_or_else(|| ResolveError::PodUnresolved {
                cluster: format!("{namespace}/{cluster_name}"),
                serial: serial.clone(),
            })?;

        let data_directory = self.data_directory(&source_claim).await?;
        let ca_secret = format!("{cluster_name}{}", cnpg::CA_SECRET_SUFFIX);
        let client_secret = format!("{cluster_name}{}", cnpg::REPLICATION_SECRET_SUFFIX);
        let credentials = self
            .load_credentials(&namespace, &ca_secret, &client_secret)
            .await?;

        let identity = SourceIdentity {
            cluster_namespace: namespace,
            cluster_name,
            source_claim: source_claim.name.clone(),
            node_name,
            pod_name: pod.name.clone(),
            pod_ip,
            client_secret,
            ca_secret,
            image: pod.image.clone(),
            data_directory,
            credentials,
        };
        tracing::debug!(
            request = %request.key(),
            cluster = %identity.cluster_identity(),
            pod = %identity.pod_name,
            node = %identity.node_name,
            "resolved source"
        );
        Ok(identity)
    }

    async fn find_source_claim(
        &self,
        request: &VolumeRequest,
        name: &str,
    ) -> Result<VolumeRequest, ResolveError> {
        let namespaces = self.candidate_namespaces(request);
        for namespace in &namespaces {
            if let Some(claim) = self.cluster.get_claim(namespace, name).await? {
                return Ok(claim);
            }
        }
        Err(ResolveError::NotFound {
            name: name.to_owned(),
            namespaces,
        })
    }

    async fn data_directory(&self, claim: &VolumeRequest) -> Result<Utf8PathBuf, ResolveError> {
        let pending = |message: &str| ResolveError::VolumePending {
            claim: claim.key(),
            message: message.to_owned(),
        };
        let volume_name = claim
            .volume_name
            .as_deref()
            .ok_or_else(|| pending("claim is not bound"))?;
        let volume = self
            .cluster
            .get_volume(volume_name)
            .await?
            .ok_or_else(|| pending("bound volume does not exist"))?;
        let path = volume.path.ok_or_else(|| ResolveError::SourceUnresolved {
            claim: claim.key(),
            message: String::from("bound volume is not a local or hostPath volume"),
        })?;
        let mut directory = Utf8PathBuf::from(path);
        if !self.pgdata_subdir.is_empty() {
            directory.push(&self.pgdata_subdir);
        }
        Ok(directory)
    }

    async fn load_credentials(
        &self,
        namespace: &str,
        ca_secret: &str,
        client_secret: &str,
    ) -> Result<DatabaseCredentials, ResolveError> {
        let ca_data = self.secret_data(namespace, ca_secret).await?;
        let client_data = self.secret_data(namespace, client_secret).await?;
        Ok(DatabaseCredentials {
            ca_pem: pem_entry(&ca_data, namespace, ca_secret, CA_KEY)?,
            cert_pem: pem_entry(&client_data, namespace, client_secret, CERT_KEY)?,
            key_pem: pem_entry(&client_data, namespace, client_secret, KEY_KEY)?,
        })
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ResolveError> {
        self.cluster
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| ResolveError::AuthUnresolved {
                secret: format!("{namespace}/{name}"),
                message: String::from("secret does not exist"),
            })
    }
}

fn owning_cluster(claim: &VolumeRequest) -> Result<String, ResolveError> {
    claim
        .owner_references
        .iter()
        .find(|owner| {
            owner.kind == cnpg::CLUSTER_KIND && owner.api_version == cnpg::CLUSTER_API_VERSION
        })
        .map(|owner| owner.name.clone())
        .ok_or_else(|| ResolveError::SourceUnresolved {
            claim: claim.key(),
            message: format!(
                "not owned by a {} {}",
                cnpg::CLUSTER_API_VERSION,
                cnpg::CLUSTER_KIND
            ),
        })
}

fn select_pod<'a>(pods: &'a [PodRecord], serial: &str) -> Option<(&'a PodRecord, String, String)> {
    pods.iter().find_map(|pod| {
        let matches_serial =
            pod.annotations.get(cnpg::NODE_SERIAL_ANNOTATION).map(String::as_str) == Some(serial);
        if !pod.ready || !matches_serial {
            return None;
        }
        let node = pod.node_name.clone()?;
        let ip = pod.pod_ip.clone()?;
        Some((pod, node, ip))
    })
}

fn pem_entry(
    data: &BTreeMap<String, Vec<u8>>,
    namespace: &str,
    secret: &str,
    key: &str,
) -> Result<String, ResolveError> {
    let unresolved = |message: String| ResolveError::AuthUnresolved {
        secret: format!("{namespace}/{secret}"),
        message,
    };
    let raw = data
        .get(key)
        .ok_or_else(|| unresolved(format!("missing key {key}")))?;
    let text = String::from_utf8(raw.clone())
        .map_err(|_| unresolved(format!("key {key} is not UTF-8")))?;
    if !text.trim_start().starts_with(PEM_BEGIN) {
        return Err(unresolved(format!("key {key} is not PEM encoded")));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSourceRef, VolumeRecord};
    use crate::test_support::{FakeCluster, SourceFixture, request_for, seed_source};
    use rstest::{fixture, rstest};

    #[fixture]
    fn cluster() -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        seed_source(&cluster, &SourceFixture::default());
        cluster
    }

    fn resolver(cluster: Arc<FakeCluster>, search: &[&str]) -> SourceResolver<FakeCluster> {
        SourceResolver::new(
            cluster,
            search.iter().map(|ns| (*ns).to_owned()).collect(),
            String::from("pgdata"),
            String::from("node-a"),
        )
    }

    #[rstest]
    #[tokio::test]
    async fn namespace_search_falls_through_to_configured_path(cluster: Arc<FakeCluster>) {
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", Some("abc-1"), None, "pg-xyz-1");

        let source = resolver.resolve(&request).await.expect("resolved");

        assert_eq!(source.cluster_identity(), "db-ns1/pg-xyz");
        assert_eq!(source.pod_name, "pg-xyz-1");
        assert_eq!(source.node_name, "node-a");
        assert_eq!(
            source.data_directory,
            Utf8PathBuf::from("/mnt/local/pg-xyz-1/pgdata")
        );
        assert_eq!(source.client_secret, "pg-xyz-replication");
        assert!(resolver.is_local(&source));
    }

    #[rstest]
    fn explicit_namespace_is_the_only_candidate(cluster: Arc<FakeCluster>) {
        let resolver = resolver(cluster, &["db-ns1", "apps"]);
        let request = request_for("apps", "r1", None, Some("db-ns2"), "pg-xyz-1");
        assert_eq!(resolver.candidate_namespaces(&request), vec!["db-ns2"]);
    }

    #[rstest]
    fn search_path_starts_with_request_namespace_without_duplicates(cluster: Arc<FakeCluster>) {
        let resolver = resolver(cluster, &["apps", "db-ns1"]);
        let request = request_for("apps", "r1", None, None, "pg-xyz-1");
        assert_eq!(
            resolver.candidate_namespaces(&request),
            vec!["apps", "db-ns1"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_source_reports_searched_namespaces(cluster: Arc<FakeCluster>) {
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", None, None, "absent");
        let err = resolver.resolve(&request).await.expect_err("not found");
        assert!(
            matches!(err, ResolveError::NotFound { ref namespaces, .. } if namespaces == &["apps", "db-ns1"]),
            "{err:?}"
        );
        assert!(err.is_transient());
    }

    #[rstest]
    #[tokio::test]
    async fn unsupported_kind_is_invalid(cluster: Arc<FakeCluster>) {
        let resolver = resolver(cluster, &["db-ns1"]);
        let mut request = request_for("apps", "r1", None, None, "pg-xyz-1");
        request.data_source = Some(DataSourceRef {
            kind: String::from("VolumeSnapshot"),
            namespace: None,
            name: String::from("pg-xyz-1"),
        });
        let err = resolver.resolve(&request).await.expect_err("invalid");
        assert!(matches!(err, ResolveError::Invalid { .. }));
        assert!(!err.is_transient());
    }

    #[rstest]
    #[tokio::test]
    async fn unready_pod_is_pod_unresolved(cluster: Arc<FakeCluster>) {
        cluster.set_pod_ready("db-ns1", "pg-xyz-1", false);
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", None, None, "pg-xyz-1");
        let err = resolver.resolve(&request).await.expect_err("no ready pod");
        assert!(matches!(err, ResolveError::PodUnresolved { .. }), "{err:?}");
    }

    #[rstest]
    #[tokio::test]
    async fn missing_replication_secret_is_auth_unresolved(cluster: Arc<FakeCluster>) {
        cluster.remove_secret("db-ns1", "pg-xyz-replication");
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", None, None, "pg-xyz-1");
        let err = resolver.resolve(&request).await.expect_err("no secret");
        assert!(
            matches!(err, ResolveError::AuthUnresolved { ref secret, .. } if secret == "db-ns1/pg-xyz-replication"),
            "{err:?}"
        );
    }

    #[rstest]
    #[case::unbound(None)]
    #[case::volume_missing(Some("pv-gone"))]
    #[tokio::test]
    async fn source_volume_not_yet_available_is_retried(
        cluster: Arc<FakeCluster>,
        #[case] volume_name: Option<&str>,
    ) {
        let mut source_claim = cluster.claim("db-ns1", "pg-xyz-1").expect("source claim");
        source_claim.volume_name = volume_name.map(str::to_owned);
        cluster.insert_claim(source_claim);
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", None, None, "pg-xyz-1");

        let err = resolver.resolve(&request).await.expect_err("volume pending");

        assert!(matches!(err, ResolveError::VolumePending { .. }), "{err:?}");
        assert!(err.is_transient());
    }

    #[rstest]
    #[tokio::test]
    async fn volume_without_host_path_is_permanent(cluster: Arc<FakeCluster>) {
        cluster.insert_volume(VolumeRecord {
            name: String::from("pv-pg-xyz-1"),
            phase: Some(String::from("Bound")),
            ..VolumeRecord::default()
        });
        let resolver = resolver(cluster, &["db-ns1"]);
        let request = request_for("apps", "r1", None, None, "pg-xyz-1");

        let err = resolver.resolve(&request).await.expect_err("not node-local");

        assert!(matches!(err, ResolveError::SourceUnresolved { .. }), "{err:?}");
        assert!(!err.is_transient());
    }

    #[test]
    fn non_pem_key_is_rejected() {
        let data = BTreeMap::from([(String::from("ca.crt"), b"not a certificate".to_vec())]);
        let err = pem_entry(&data, "db-ns1", "pg-xyz-ca", "ca.crt").expect_err("not pem");
        assert!(matches!(err, ResolveError::AuthUnresolved { .. }));
    }

    #[test]
    fn claim_without_cluster_owner_is_unresolved() {
        let claim = request_for("db-ns1", "orphan", None, None, "x");
        let err = owning_cluster(&claim).expect_err("no owner");
        assert!(matches!(err, ResolveError::SourceUnresolved { .. }));
    }

    #[test]
    fn remote_source_is_not_local() {
        let resolver = SourceResolver::new(
            Arc::new(FakeCluster::new()),
            Vec::new(),
            String::from("pgdata"),
            String::from("node-b"),
        );
        let source = crate::test_support::sample_source();
        assert!(!resolver.is_local(&source));
    }
}
