//! Shared fixture for provisioning and cleanup scenarios.
//!
//! The controller under test runs on `node-a` with `db-ns1` on its namespace
//! search path. The host filesystem is rooted in a temporary directory.

use std::sync::Arc;

use camino::Utf8PathBuf;
use pg_reflinker::model::{VolumeRecord, VolumeRequest};
use pg_reflinker::test_support::{NodeHarness, SourceFixture, config_for_node};
use pg_reflinker::{PublishOutcome, RequestOutcome};
use rstest::fixture;
use rstest_bdd_macros::given;
use tempfile::TempDir;
use tokio::runtime::Runtime;

pub const NODE: &str = "node-a";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("scenario setup failed: {0}")]
    Setup(String),
}

pub struct Node {
    _temp: TempDir,
    pub harness: NodeHarness,
    pub runtime: Runtime,
}

#[derive(Clone, Debug)]
pub enum ReconcileResult {
    Success(RequestOutcome),
    Failure { message: String, transient: bool },
}

#[derive(Clone)]
pub struct NodeContext {
    pub node: Arc<Node>,
    pub request: Option<VolumeRequest>,
    pub results: Vec<ReconcileResult>,
}

impl NodeContext {
    pub fn harness(&self) -> &NodeHarness {
        &self.node.harness
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.node.runtime.block_on(future)
    }

    /// Stores the declared claim and reconciles it once.
    pub fn reconcile(&mut self) {
        let Some(request) = self.request.clone() else {
            panic!("scenario must declare a claim before reconciling");
        };
        self.harness().cluster.insert_claim(request.clone());
        let result = self.block_on(self.harness().reconciler.reconcile_request(&request));
        self.results.push(match result {
            Ok(outcome) => ReconcileResult::Success(outcome),
            Err(err) => ReconcileResult::Failure {
                transient: err.is_transient(),
                message: err.to_string(),
            },
        });
    }

    pub fn last_result(&self) -> Result<&ReconcileResult, StepError> {
        self.results
            .last()
            .ok_or_else(|| StepError::Assertion(String::from("no reconcile has run")))
    }

    pub fn published_volume(&self) -> Result<PublishOutcome, StepError> {
        match self.last_result()? {
            ReconcileResult::Success(RequestOutcome::Published(outcome)) => Ok(outcome.clone()),
            other => Err(StepError::Assertion(format!(
                "expected a published volume, got {other:?}"
            ))),
        }
    }

    /// The single volume this node has published.
    pub fn only_volume(&self) -> Result<VolumeRecord, StepError> {
        let mut volumes = self.harness().cluster.published_volumes();
        match (volumes.pop(), volumes.is_empty()) {
            (Some(volume), true) => Ok(volume),
            (None, _) => Err(StepError::Assertion(String::from("no volume published"))),
            (Some(_), false) => Err(StepError::Assertion(format!(
                "expected one volume, found {}",
                volumes.len() + 1
            ))),
        }
    }
}

#[fixture]
pub fn node_context() -> NodeContext {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
    let mut config = config_for_node(NODE);
    config.host_root = root.to_string();
    config.namespace_path = String::from("db-ns1");
    let harness =
        NodeHarness::with_config(config).unwrap_or_else(|err| panic!("node harness: {err}"));
    let runtime = Runtime::new().unwrap_or_else(|err| panic!("tokio runtime: {err}"));
    NodeContext {
        node: Arc::new(Node {
            _temp: temp,
            harness,
            runtime,
        }),
        request: None,
        results: Vec::new(),
    }
}

#[given("a database cluster \"{cluster}\" in namespace \"{namespace}\" on this node")]
fn database_cluster_on_node(
    node_context: NodeContext,
    cluster: String,
    namespace: String,
) -> Result<NodeContext, StepError> {
    let fixture = SourceFixture {
        instance: format!("{cluster}-1"),
        cluster,
        namespace,
        node: NODE.to_owned(),
        ..SourceFixture::default()
    };
    node_context
        .harness()
        .seed(&fixture)
        .map_err(|err| StepError::Setup(err.to_string()))?;
    Ok(node_context)
}
