//! BDD step definitions for the benchmark driver.

use gridbench::BenchError;
use gridbench::registry::{RegistryError, ReservationKind, ReservationState};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Builder;

use super::test_helpers::{
    BenchContext, BenchFailure, BenchFailureKind, BenchResult, BenchSuccess,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a grid with \"{count}\" eligible shard nodes")]
fn grid_with_nodes(bench_context: BenchContext, count: usize) -> BenchContext {
    bench_context.set_eligible_nodes(count);
    bench_context
}

#[given("provisioning call \"{call}\" fails")]
fn provisioning_call_fails(bench_context: BenchContext, call: u32) -> BenchContext {
    bench_context.grid.fail_provision_call(call);
    bench_context
}

#[given("\"{kind}\" reservations settle in state \"{state}\"")]
fn reservations_settle(
    bench_context: BenchContext,
    kind: String,
    state: String,
) -> Result<BenchContext, StepError> {
    bench_context
        .grid
        .settle(parse_kind(&kind)?, parse_state(&state)?);
    Ok(bench_context)
}

#[given("the tunnel cannot be brought up")]
fn tunnel_fails(bench_context: BenchContext) -> BenchContext {
    bench_context.grid.fail_tunnel_up();
    bench_context
}

#[given("downloads of \"{size}\" MiB files are corrupted")]
fn downloads_corrupted(bench_context: BenchContext, size: u64) -> BenchContext {
    bench_context.bucket.corrupt_downloads_of(size);
    bench_context
}

#[given("deleting reservation \"{id}\" fails")]
fn delete_fails(bench_context: BenchContext, id: String) -> BenchContext {
    bench_context.grid.fail_delete(&id);
    bench_context
}

#[when("the benchmark runs")]
fn benchmark_runs(mut bench_context: BenchContext) -> Result<BenchContext, StepError> {
    let runtime = Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let driver = bench_context.driver();
    let mut rng = StdRng::seed_from_u64(7);

    let outcome = match runtime.block_on(driver.run(&mut rng)) {
        Ok(report) => BenchResult::Success(BenchSuccess {
            trials: report
                .statistics
                .iter()
                .map(|record| (record.size_mb, record.hash_match))
                .collect(),
            teardown_failures: report.teardown.failed.len(),
        }),
        Err(err) => BenchResult::Failure(BenchFailure {
            kind: map_failure_kind(&err),
            message: err.to_string(),
        }),
    };
    bench_context.outcome = Some(outcome);
    Ok(bench_context)
}

fn success(bench_context: &BenchContext) -> Result<&BenchSuccess, StepError> {
    match bench_context.outcome {
        Some(BenchResult::Success(ref success)) => Ok(success),
        Some(BenchResult::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the benchmark succeeds")]
fn benchmark_succeeds(bench_context: &BenchContext) -> Result<(), StepError> {
    success(bench_context).map(drop)
}

#[then("the benchmark fails with \"{kind}\"")]
fn benchmark_fails(bench_context: &BenchContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let Some(BenchResult::Failure(failure)) = &bench_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )))
    }
}

#[then("trial results are \"{expected}\"")]
fn trial_results(bench_context: &BenchContext, expected: String) -> Result<(), StepError> {
    let rendered = success(bench_context)?
        .trials
        .iter()
        .map(|(size, matched)| format!("{size}:{matched}"))
        .collect::<Vec<_>>()
        .join(",");
    if rendered == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected trials {expected}, got {rendered}"
        )))
    }
}

#[then("\"{count}\" teardown action failed")]
fn teardown_failures(bench_context: &BenchContext, count: usize) -> Result<(), StepError> {
    let failures = success(bench_context)?.teardown_failures;
    if failures == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} teardown failures, got {failures}"
        )))
    }
}

#[then("reservations were released in order \"{expected}\"")]
fn released_in_order(bench_context: &BenchContext, expected: String) -> Result<(), StepError> {
    let deleted = bench_context.grid.deleted().join(",");
    if deleted == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected deletions {expected}, got {deleted}"
        )))
    }
}

#[then("no reservation is left behind")]
fn nothing_leaked(bench_context: &BenchContext) -> Result<(), StepError> {
    let leaked = bench_context.grid.leaked();
    if leaked.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "reservations left behind: {}",
            leaked.join(",")
        )))
    }
}

#[then("the tunnel is down")]
fn tunnel_down(bench_context: &BenchContext) -> Result<(), StepError> {
    if bench_context.grid.tunnel_is_up() {
        Err(StepError::Assertion(String::from("tunnel is still up")))
    } else {
        Ok(())
    }
}

#[then("no provisioning call was made")]
fn nothing_provisioned(bench_context: &BenchContext) -> Result<(), StepError> {
    let invocations = bench_context.grid.invocations();
    if invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no tool invocations, got {}",
            invocations
                .iter()
                .map(gridbench::test_support::CommandInvocation::command_string)
                .collect::<Vec<_>>()
                .join("; ")
        )))
    }
}

const fn map_failure_kind(err: &BenchError) -> BenchFailureKind {
    match err {
        BenchError::InsufficientNodes { .. } => BenchFailureKind::InsufficientNodes,
        BenchError::Provision { .. } => BenchFailureKind::Provision,
        BenchError::Deployment { .. } => BenchFailureKind::Deployment,
        BenchError::Converge {
            source: RegistryError::ProvisionTimeout { .. },
            ..
        } => BenchFailureKind::Timeout,
        BenchError::Tunnel(_) => BenchFailureKind::Tunnel,
        _ => BenchFailureKind::Other,
    }
}

fn parse_failure_kind(kind: &str) -> Result<BenchFailureKind, StepError> {
    match kind {
        "insufficient-nodes" => Ok(BenchFailureKind::InsufficientNodes),
        "provision" => Ok(BenchFailureKind::Provision),
        "deployment" => Ok(BenchFailureKind::Deployment),
        "timeout" => Ok(BenchFailureKind::Timeout),
        "tunnel" => Ok(BenchFailureKind::Tunnel),
        _ => Err(StepError::Assertion(format!(
            "unknown failure kind: {kind}"
        ))),
    }
}

fn parse_kind(kind: &str) -> Result<ReservationKind, StepError> {
    match kind {
        "network" => Ok(ReservationKind::Network),
        "zdb" => Ok(ReservationKind::Zdb),
        "container" => Ok(ReservationKind::Container),
        _ => Err(StepError::Assertion(format!(
            "unknown reservation kind: {kind}"
        ))),
    }
}

fn parse_state(state: &str) -> Result<ReservationState, StepError> {
    match state {
        "pending" => Ok(ReservationState::Pending),
        "deploy" => Ok(ReservationState::Deploy),
        "ok" => Ok(ReservationState::Ok),
        "error" => Ok(ReservationState::Error),
        _ => Err(StepError::Assertion(format!(
            "unknown reservation state: {state}"
        ))),
    }
}
