//! BDD scenarios for cleanup of published volumes.

use rstest_bdd_macros::scenario;

use crate::node_context::{NodeContext, node_context};

#[scenario(
    path = "tests/features/cleanup.feature",
    name = "Delete reclaim policy removes the snapshot"
)]
fn scenario_delete_policy(node_context: NodeContext) {
    let _ = node_context;
}

#[scenario(
    path = "tests/features/cleanup.feature",
    name = "Retain reclaim policy keeps the snapshot"
)]
fn scenario_retain_policy(node_context: NodeContext) {
    let _ = node_context;
}

#[scenario(
    path = "tests/features/cleanup.feature",
    name = "A failed volume is deleted and cleaned up"
)]
fn scenario_failed_volume(node_context: NodeContext) {
    let _ = node_context;
}
