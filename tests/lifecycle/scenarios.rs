//! BDD scenarios for the volume lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Mount a volume on the first free slot and tear it down"
)]
fn scenario_mount_and_teardown(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Derive provisioned IOPS from the volume size"
)]
fn scenario_derive_iops(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Skip contended device slots"
)]
fn scenario_skip_contended_slots(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Remove the volume when formatting fails"
)]
fn scenario_compensate_mount_failure(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Report compensation failures alongside the cause"
)]
fn scenario_report_compensation_failure(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Tearing down a removed volume reports it as missing"
)]
fn scenario_teardown_twice(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Run a workload and always remove the volume"
)]
fn scenario_scoped_workload(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
