//! BDD scenarios for claim provisioning.

use rstest_bdd_macros::scenario;

use crate::node_context::{NodeContext, node_context};

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Publish a clone found through the namespace search path"
)]
fn scenario_publish_through_search_path(node_context: NodeContext) {
    let _ = node_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Reconciling twice publishes a single volume"
)]
fn scenario_reconcile_twice(node_context: NodeContext) {
    let _ = node_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "A failed copy publishes nothing and ends the backup"
)]
fn scenario_failed_copy(node_context: NodeContext) {
    let _ = node_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "A uid that cannot be a label is refused"
)]
fn scenario_unsafe_uid(node_context: NodeContext) {
    let _ = node_context;
}
