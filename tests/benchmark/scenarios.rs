//! BDD scenarios for the benchmark driver.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BenchContextResult, bench_context_result};

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Measure round trips and release everything in reverse"
)]
fn scenario_full_run(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Refuse to start without enough shard nodes"
)]
fn scenario_insufficient_nodes(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Roll back the whole shard set when one shard is refused"
)]
fn scenario_shard_rollback(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Release a compute workload that fails to deploy"
)]
fn scenario_compute_failure(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Give up on a network that never converges"
)]
fn scenario_network_timeout(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Release the network when the tunnel cannot be brought up"
)]
fn scenario_tunnel_failure(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Flag a corrupted download and keep measuring"
)]
fn scenario_corrupted_download(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}

#[scenario(
    path = "tests/features/benchmark.feature",
    name = "Report teardown failures without failing the run"
)]
fn scenario_teardown_failure(bench_context_result: BenchContextResult) {
    drop(bench_context_result);
}
