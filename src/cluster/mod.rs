//! Cluster API abstraction.
//!
//! Everything the controller reads from or writes to the Kubernetes API goes
//! through [`ClusterApi`], expressed in the domain records of
//! [`crate::model`]. [`KubeCluster`] is the real implementation; tests use
//! [`crate::test_support::FakeCluster`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{PodRecord, PublishedVolume, StorageClassRecord, VolumeRecord, VolumeRequest};

mod kubernetes;

pub use self::kubernetes::{KubeCluster, claim_to_request, published_volume_object, volume_to_record};

/// Future returned by cluster operations.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send + 'a>>;

/// Errors raised by cluster operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Raised when creating an object whose name is taken.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },
    /// Raised when an object cannot be converted into a domain record.
    #[error("malformed {kind} {name}: {message}")]
    Malformed {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// What is wrong with it.
        message: String,
    },
    /// Wrapper for API server failures.
    #[error("kubernetes api error: {message}")]
    Api {
        /// Message returned by the client.
        message: String,
    },
}

/// Operations the controller needs from the cluster.
pub trait ClusterApi: Send + Sync {
    /// Fetches a claim; `None` when it does not exist.
    fn get_claim<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<VolumeRequest>>;

    /// Lists the pods of a database cluster.
    fn list_cluster_pods<'a>(
        &'a self,
        namespace: &'a str,
        cluster: &'a str,
    ) -> ClusterFuture<'a, Vec<PodRecord>>;

    /// Fetches the decoded data of a secret; `None` when it does not exist.
    fn get_secret<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<BTreeMap<String, Vec<u8>>>>;

    /// Fetches a storage class; `None` when it does not exist.
    fn get_storage_class<'a>(
        &'a self,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<StorageClassRecord>>;

    /// Fetches a persistent volume; `None` when it does not exist.
    fn get_volume<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, Option<VolumeRecord>>;

    /// Lists the persistent volumes published by this controller.
    fn list_published_volumes(&self) -> ClusterFuture<'_, Vec<VolumeRecord>>;

    /// Creates a persistent volume, failing with
    /// [`ClusterError::AlreadyExists`] when the name is taken.
    fn create_volume<'a>(&'a self, volume: &'a PublishedVolume) -> ClusterFuture<'a, ()>;

    /// Deletes a persistent volume. Deleting a missing volume succeeds.
    fn delete_volume<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, ()>;

    /// Sets (`Some`) or clears (`None`) an annotation on a claim.
    fn annotate_claim<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        key: &'a str,
        value: Option<&'a str>,
    ) -> ClusterFuture<'a, ()>;
}
