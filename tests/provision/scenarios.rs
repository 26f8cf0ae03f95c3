//! BDD scenarios for provisioning strategies.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContext, provision_context};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Race keeps the first machine to become reachable"
)]
fn scenario_race_winner(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Exhausted batches leave nothing running"
)]
fn scenario_race_exhausted(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Failover replaces a machine that fails the command check"
)]
fn scenario_failover(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Cold start falls back to a deferred backup"
)]
fn scenario_cold_start_backup(provision_context: ProvisionContext) {
    let _ = provision_context;
}
