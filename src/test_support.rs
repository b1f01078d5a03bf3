//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::lifecycle::ReservationId;
use crate::registry::{
    Node, NodeCapacity, PublicConfig, RegistryApi, RegistryError, RegistryFuture,
    ReservationKind, ReservationResult, ReservationState,
};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns the number of responses not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.responses.borrow().len()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

#[derive(Debug, Default)]
struct RegistryScript {
    nodes: Vec<Node>,
    nodes_unavailable: bool,
    node_fetches: u32,
    results: HashMap<String, VecDeque<ReservationResult>>,
    fetches: HashMap<String, u32>,
}

/// Scripted registry transport.
///
/// Each reservation replays its queued results in order; the last queued
/// result repeats once the queue is down to one entry. Unknown reservations
/// answer with [`RegistryError::Unavailable`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedRegistry {
    script: Arc<Mutex<RegistryScript>>,
}

impl ScriptedRegistry {
    /// Creates an empty registry with no nodes and no reservations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the node list served by `fetch_nodes`.
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.lock().nodes = nodes;
    }

    /// Makes `fetch_nodes` fail with [`RegistryError::Unavailable`].
    pub fn fail_nodes(&self) {
        self.lock().nodes_unavailable = true;
    }

    /// Queues a full result for the reservation it names.
    pub fn push_result(&self, result: ReservationResult) {
        self.lock()
            .results
            .entry(result.id.clone())
            .or_default()
            .push_back(result);
    }

    /// Queues one result per state for reservation `id`, with an empty
    /// payload.
    pub fn script_states(&self, id: &str, kind: ReservationKind, states: &[ReservationState]) {
        for state in states {
            self.push_result(reservation_result(id, kind, *state, serde_json::Value::Null));
        }
    }

    /// Returns how many times `fetch_nodes` was called.
    #[must_use]
    pub fn node_fetches(&self) -> u32 {
        self.lock().node_fetches
    }

    /// Returns how many times reservation `id` was fetched.
    #[must_use]
    pub fn fetch_count(&self, id: &str) -> u32 {
        self.lock().fetches.get(id).copied().unwrap_or_default()
    }
}

impl RegistryApi for ScriptedRegistry {
    fn fetch_nodes(&self) -> RegistryFuture<'_, Vec<Node>> {
        let outcome = {
            let mut script = self.lock();
            script.node_fetches += 1;
            if script.nodes_unavailable {
                Err(RegistryError::Unavailable {
                    endpoint: String::from("scripted://nodes"),
                    message: String::from("simulated outage"),
                })
            } else {
                Ok(script.nodes.clone())
            }
        };
        Box::pin(async move { outcome })
    }

    fn fetch_reservation<'a>(
        &'a self,
        id: &'a ReservationId,
    ) -> RegistryFuture<'a, ReservationResult> {
        let outcome = {
            let mut script = self.lock();
            *script.fetches.entry(id.as_str().to_owned()).or_default() += 1;
            let queue = script.results.get_mut(id.as_str());
            let next = match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            next.ok_or_else(|| RegistryError::Unavailable {
                endpoint: format!("scripted://reservations/{id}"),
                message: String::from("unknown reservation"),
            })
        };
        Box::pin(async move { outcome })
    }
}

/// Builds a node snapshot for tests.
#[must_use]
pub fn node(id: &str, last_heartbeat: i64, sru: u64, public: bool) -> Node {
    Node {
        id: id.to_owned(),
        last_heartbeat,
        capacity: NodeCapacity {
            sru,
            ..NodeCapacity::default()
        },
        public_config: public.then(PublicConfig::default),
    }
}

/// Builds a reservation result for tests.
#[must_use]
pub fn reservation_result(
    id: &str,
    kind: ReservationKind,
    state: ReservationState,
    data: serde_json::Value,
) -> ReservationResult {
    ReservationResult {
        id: id.to_owned(),
        kind,
        state,
        error_message: String::new(),
        data,
    }
}

/// Returns the current Unix time in seconds, for building fresh heartbeats.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .map(String::as_str)
}

fn lossy_args(args: &[OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn succeed(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Reservation issued through [`FakeGrid`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionRecord {
    /// Identifier handed back to the caller.
    pub id: String,
    /// Kind inferred from the schema file name.
    pub kind: ReservationKind,
    /// Target node.
    pub node: String,
}

#[derive(Debug, Default)]
struct GridState {
    invocations: Vec<CommandInvocation>,
    provision_calls: u32,
    provisioned: Vec<ProvisionRecord>,
    deleted: Vec<String>,
    outcomes: HashMap<ReservationKind, ReservationState>,
    failing_provision: Option<u32>,
    failing_deletes: Vec<String>,
    tunnel_up_fails: bool,
    tunnel_down_fails: bool,
    tunnel_up: bool,
}

/// Stand-in for the provisioning tool and the tunnel tool.
///
/// Provisioning calls issue identifiers of the form `<kind>-<n>` and publish
/// a matching result on the wrapped [`ScriptedRegistry`], settled as
/// configured per kind (`ok` by default). Storage shards get a payload with
/// namespace `ns-<id>`, address `2001:db8::<n>` and port 9900.
#[derive(Clone, Debug)]
pub struct FakeGrid {
    state: Rc<RefCell<GridState>>,
    registry: ScriptedRegistry,
}

impl FakeGrid {
    /// Creates a grid publishing reservations on `registry`.
    #[must_use]
    pub fn new(registry: ScriptedRegistry) -> Self {
        Self {
            state: Rc::default(),
            registry,
        }
    }

    /// Returns the registry reservations are published on.
    #[must_use]
    pub fn registry(&self) -> ScriptedRegistry {
        self.registry.clone()
    }

    /// Reservations of `kind` issued from now on settle in `state`.
    pub fn settle(&self, kind: ReservationKind, state: ReservationState) {
        self.state.borrow_mut().outcomes.insert(kind, state);
    }

    /// Makes the `call`-th provisioning call (1-based) fail.
    pub fn fail_provision_call(&self, call: u32) {
        self.state.borrow_mut().failing_provision = Some(call);
    }

    /// Makes deleting reservation `id` fail.
    pub fn fail_delete(&self, id: &str) {
        self.state.borrow_mut().failing_deletes.push(id.to_owned());
    }

    /// Makes bringing the tunnel up fail.
    pub fn fail_tunnel_up(&self) {
        self.state.borrow_mut().tunnel_up_fails = true;
    }

    /// Makes bringing the tunnel down fail.
    pub fn fail_tunnel_down(&self) {
        self.state.borrow_mut().tunnel_down_fails = true;
    }

    /// Returns every invocation received so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state.borrow().invocations.clone()
    }

    /// Returns the number of provisioning calls received, failed ones
    /// included.
    #[must_use]
    pub fn provision_calls(&self) -> u32 {
        self.state.borrow().provision_calls
    }

    /// Returns the reservations issued so far.
    #[must_use]
    pub fn provisioned(&self) -> Vec<ProvisionRecord> {
        self.state.borrow().provisioned.clone()
    }

    /// Returns the reservations deleted so far, in deletion order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.state.borrow().deleted.clone()
    }

    /// Returns reservations issued but not deleted.
    #[must_use]
    pub fn leaked(&self) -> Vec<String> {
        let state = self.state.borrow();
        state
            .provisioned
            .iter()
            .filter(|record| !state.deleted.contains(&record.id))
            .map(|record| record.id.clone())
            .collect()
    }

    /// Returns `true` while the tunnel is up.
    #[must_use]
    pub fn tunnel_is_up(&self) -> bool {
        self.state.borrow().tunnel_up
    }

    fn tunnel(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        match args.first().map(String::as_str) {
            Some("up") if state.tunnel_up_fails => fail("simulated tunnel failure"),
            Some("down") if state.tunnel_down_fails => fail("simulated tunnel failure"),
            Some("up") => {
                state.tunnel_up = true;
                succeed("")
            }
            Some("down") => {
                state.tunnel_up = false;
                succeed("")
            }
            _ => fail("unsupported tunnel command"),
        }
    }

    fn tool(&self, args: &[String]) -> CommandOutput {
        match args.first().map(String::as_str) {
            Some("id") => succeed("seed written to user.seed\n"),
            Some("generate") if args.iter().any(|arg| arg == "add-node") => succeed(""),
            Some("generate") if args.iter().any(|arg| arg == "add-access") => {
                succeed("[Interface]\nPrivateKey = fake\n")
            }
            Some("generate") => succeed(format!("{{\"generated\":\"{}\"}}", args.join(" "))),
            Some("provision") => self.provision(args),
            Some("delete") => self.delete(args),
            _ => fail("unsupported tool command"),
        }
    }

    fn provision(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        state.provision_calls += 1;
        let call = state.provision_calls;
        if state.failing_provision == Some(call) {
            return fail("simulated provisioning failure");
        }

        let schema = flag_value(args, "--schema").unwrap_or_default();
        let file = schema.rsplit('/').next().unwrap_or_default();
        let kind = if file.starts_with("network") {
            ReservationKind::Network
        } else if file.starts_with("zdb") {
            ReservationKind::Zdb
        } else if file.starts_with("container") {
            ReservationKind::Container
        } else {
            ReservationKind::Unknown
        };
        let id = format!("{kind}-{call}");
        let settled = state
            .outcomes
            .get(&kind)
            .copied()
            .unwrap_or(ReservationState::Ok);
        let data = if kind == ReservationKind::Zdb {
            serde_json::json!({
                "Namespace": format!("ns-{id}"),
                "IP": format!("2001:db8::{call}"),
                "Port": 9900,
            })
        } else {
            serde_json::Value::Null
        };
        let mut result = reservation_result(&id, kind, settled, data);
        if settled == ReservationState::Error {
            result.error_message = String::from("simulated deployment failure");
        }
        self.registry.push_result(result);

        state.provisioned.push(ProvisionRecord {
            id: id.clone(),
            kind,
            node: flag_value(args, "--node").unwrap_or_default().to_owned(),
        });
        succeed(format!(
            "signing reservation\nResource: https://registry.test/reservations/{id}\n"
        ))
    }

    fn delete(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let id = flag_value(args, "--id").unwrap_or_default().to_owned();
        if state.failing_deletes.contains(&id) {
            return fail("simulated delete failure");
        }
        state.deleted.push(id);
        succeed("")
    }
}

impl CommandRunner for FakeGrid {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.state.borrow_mut().invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let args = lossy_args(args);
        if program.ends_with("wg-quick") {
            Ok(self.tunnel(&args))
        } else {
            Ok(self.tool(&args))
        }
    }
}

#[derive(Debug, Default)]
struct BucketState {
    invocations: Vec<CommandInvocation>,
    transient_failures: u32,
    corrupt_sizes: Vec<u64>,
    failing_uploads: Vec<u64>,
}

/// Stand-in for the storage client backed by a local directory.
///
/// Uploads copy the file into the directory, downloads copy it back out.
/// Sizes are recognised from the `random-<size>MB-` file name prefix.
#[derive(Clone, Debug)]
pub struct LocalBucket {
    root: std::path::PathBuf,
    state: Rc<RefCell<BucketState>>,
}

impl LocalBucket {
    /// Stores objects under `root`, which must exist.
    #[must_use]
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Rc::default(),
        }
    }

    /// Makes the next `count` invocations fail, whatever they are.
    pub fn fail_next(&self, count: u32) {
        self.state.borrow_mut().transient_failures = count;
    }

    /// Flips the first byte of every download of a `size_mb` file.
    pub fn corrupt_downloads_of(&self, size_mb: u64) {
        self.state.borrow_mut().corrupt_sizes.push(size_mb);
    }

    /// Makes every upload of a `size_mb` file fail.
    pub fn fail_uploads_of(&self, size_mb: u64) {
        self.state.borrow_mut().failing_uploads.push(size_mb);
    }

    /// Returns every invocation received so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state.borrow().invocations.clone()
    }

    fn matches_size(name: &str, sizes: &[u64]) -> bool {
        sizes
            .iter()
            .any(|size| name.starts_with(&format!("random-{size}MB-")))
    }

    fn copy(&self, source: &str, dest: &str) -> std::io::Result<()> {
        let state = self.state.borrow();
        if let Some(name) = source.strip_prefix(&format!("{}/", crate::bench::BUCKET)) {
            std::fs::copy(self.root.join(name), dest)?;
            if Self::matches_size(name, &state.corrupt_sizes) {
                let mut bytes = std::fs::read(dest)?;
                if let Some(first) = bytes.first_mut() {
                    *first ^= 0xff;
                }
                std::fs::write(dest, bytes)?;
            }
            return Ok(());
        }

        let name = std::path::Path::new(source)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if Self::matches_size(&name, &state.failing_uploads) {
            return Err(std::io::Error::other("simulated upload failure"));
        }
        std::fs::copy(source, self.root.join(name)).map(drop)
    }
}

impl CommandRunner for LocalBucket {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.state.borrow_mut().invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        {
            let mut state = self.state.borrow_mut();
            if state.transient_failures > 0 {
                state.transient_failures -= 1;
                return Ok(fail("simulated connection refused"));
            }
        }

        let args = lossy_args(args);
        let command = args.get(2..).unwrap_or_default();
        let output = match command {
            [verb, _] if verb == "mb" => succeed("Bucket created successfully\n"),
            [verb, source, dest] if verb == "cp" => match self.copy(source, dest) {
                Ok(()) => succeed(""),
                Err(err) => fail(err.to_string()),
            },
            _ => fail("unsupported storage client command"),
        };
        Ok(output)
    }
}
