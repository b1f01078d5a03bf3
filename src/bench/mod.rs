//! Benchmark driver: provisions the network, storage shards and compute
//! workload in order, runs the upload/download trials and tears everything
//! down again.
//!
//! The run is strictly sequential. Each step registers the teardown of what
//! it created on a [`CleanupScope`] as soon as the creation call is accepted,
//! before waiting for convergence, so a reservation that never reaches `ok`
//! is still released.

use std::fmt;

use camino::Utf8PathBuf;
use rand::Rng;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cleanup::{CleanupError, CleanupScope, UnwindReport};
use crate::command::{CommandError, CommandRunner};
use crate::lifecycle::{LifecycleError, Provisioner, ReservationId};
use crate::registry::{
    CapacityKind, NodeFilter, RegistryApi, RegistryClient, RegistryError, ReservationResult,
    ReservationState, StoragePayload, select_node, shuffle_nodes,
};

mod client;
mod settings;
mod trial;
mod tunnel;

pub use client::{
    BUCKET, CONFIG_FILE, DEFAULT_STORAGE_CLIENT_BIN, HOST_ALIAS, StorageClient, StorageEndpoint,
};
pub use settings::{
    BenchSettings, ComputeSettings, Distribution, DistributionError, NetworkSettings,
    ShardSettings,
};
pub use trial::{TrialError, TrialStatistics, hash_file, write_random_file, write_statistics};
pub use tunnel::{DEFAULT_TUNNEL_BIN, Tunnel};

/// Schema file of the private network.
pub const NETWORK_SCHEMA: &str = "network.json";
/// Schema file shared by every storage shard.
pub const SHARD_SCHEMA: &str = "zdb.json";
/// Schema file of the compute workload.
pub const COMPUTE_SCHEMA: &str = "container.json";
/// Entrypoint of the storage server image.
pub const COMPUTE_ENTRYPOINT: &str = "/bin/entrypoint";

/// Provisioning steps, used to label errors and cleanup actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// User identity creation.
    Identity,
    /// Private network.
    Network,
    /// Local tunnel interface.
    Tunnel,
    /// Storage shard set.
    Shards,
    /// Compute workload.
    Compute,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Network => "network",
            Self::Tunnel => "tunnel",
            Self::Shards => "storage shards",
            Self::Compute => "compute workload",
        };
        f.write_str(name)
    }
}

/// Errors raised by the benchmark driver.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Raised when node discovery fails.
    #[error("failed to discover nodes: {0}")]
    Discovery(#[source] RegistryError),
    /// Raised when fewer shard-eligible nodes exist than shards requested.
    #[error("not enough eligible nodes for storage shards: required {required}, found {available}")]
    InsufficientNodes {
        /// Shards requested.
        required: usize,
        /// Eligible nodes found.
        available: usize,
    },
    /// Raised when a provisioning call fails.
    #[error("failed to provision {step}: {source}")]
    Provision {
        /// Failing step.
        step: Step,
        /// Lifecycle failure.
        #[source]
        source: LifecycleError,
    },
    /// Raised when waiting for convergence fails.
    #[error("{step} did not converge: {source}")]
    Converge {
        /// Failing step.
        step: Step,
        /// Registry failure.
        #[source]
        source: RegistryError,
    },
    /// Raised when a reservation converges to a state other than `ok`.
    #[error("{step} reservation {id} has state {state}: {message}")]
    Deployment {
        /// Failing step.
        step: Step,
        /// Reservation identifier.
        id: String,
        /// Terminal state reported.
        state: ReservationState,
        /// Error message reported by the node.
        message: String,
    },
    /// Raised when a shard payload cannot be read.
    #[error("storage shard payload unusable: {0}")]
    ShardPayload(#[source] RegistryError),
    /// Raised when the tunnel cannot be brought up.
    #[error("failed to bring tunnel up: {0}")]
    Tunnel(#[source] Box<CommandError>),
    /// Raised when a teardown cannot be registered.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    /// Raised when the storage client cannot be configured.
    #[error("failed to prepare {path}: {message}")]
    Workspace {
        /// Path being prepared.
        path: Utf8PathBuf,
        /// I/O error message.
        message: String,
    },
    /// Raised when the benchmark bucket cannot be created.
    #[error("failed to create bucket: {0}")]
    Bucket(#[source] crate::retry::RetryError),
}

/// Placement decided before anything is provisioned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Plan {
    /// Node hosting the network endpoint and compute workload.
    pub node: String,
    /// One node per storage shard, in provisioning order.
    pub shard_nodes: Vec<String>,
}

/// Connection details of one provisioned shard.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShardEndpoint {
    /// Namespace allocated on the shard.
    pub namespace: String,
    /// Namespace password.
    pub password: String,
    /// Shard address.
    pub ip: String,
    /// Shard port.
    pub port: u16,
}

impl ShardEndpoint {
    fn from_payload(payload: StoragePayload, password: &str) -> Self {
        Self {
            namespace: payload.namespace,
            password: password.to_owned(),
            ip: payload.ip,
            port: payload.port,
        }
    }
}

impl fmt::Display for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@[{}]:{}",
            self.namespace, self.password, self.ip, self.port
        )
    }
}

/// Joins shard connection strings with `,`.
#[must_use]
pub fn shard_list(shards: &[ShardEndpoint]) -> String {
    shards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Result of a completed benchmark.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchReport {
    /// Placement used.
    pub plan: Plan,
    /// Statistics of the trials that completed.
    pub statistics: Vec<TrialStatistics>,
    /// Outcome of the final teardown.
    pub teardown: UnwindReport,
}

/// Orchestrates one benchmark run.
#[derive(Debug)]
pub struct BenchDriver<R: CommandRunner, C: CommandRunner, A> {
    provisioner: Provisioner<R>,
    tunnel: Tunnel<R>,
    registry: RegistryClient<A>,
    storage: StorageClient<C>,
    settings: BenchSettings,
}

impl<R, C, A> BenchDriver<R, C, A>
where
    R: CommandRunner + Clone + 'static,
    C: CommandRunner,
    A: RegistryApi,
{
    /// Assembles a driver from its collaborators.
    #[must_use]
    pub const fn new(
        provisioner: Provisioner<R>,
        tunnel: Tunnel<R>,
        registry: RegistryClient<A>,
        storage: StorageClient<C>,
        settings: BenchSettings,
    ) -> Self {
        Self {
            provisioner,
            tunnel,
            registry,
            storage,
            settings,
        }
    }

    /// Returns the run settings.
    #[must_use]
    pub const fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    /// Plans, provisions, measures and tears down.
    ///
    /// Teardown runs whether or not a step failed; teardown failures are
    /// logged and reported in [`BenchReport::teardown`], never escalated.
    ///
    /// # Errors
    ///
    /// Returns the first [`BenchError`] raised by planning or provisioning,
    /// after everything registered so far has been unwound.
    pub async fn run<G: Rng + ?Sized>(&self, rng: &mut G) -> Result<BenchReport, BenchError> {
        let mut scope = CleanupScope::new();
        let outcome = self.run_in(&mut scope, rng).await;
        let teardown = scope.unwind_all();
        if !teardown.is_clean() {
            warn!(
                failed = teardown.failed.len(),
                "teardown incomplete; some resources may still be reserved"
            );
        }

        let (plan, statistics) = outcome?;
        Ok(BenchReport {
            plan,
            statistics,
            teardown,
        })
    }

    /// Plans and executes the run, registering every teardown on `scope`.
    ///
    /// The caller owns `scope` and decides when to unwind it.
    ///
    /// # Errors
    ///
    /// Returns the first [`BenchError`]; nothing is unwound here.
    pub async fn run_in<G: Rng + ?Sized>(
        &self,
        scope: &mut CleanupScope,
        rng: &mut G,
    ) -> Result<(Plan, Vec<TrialStatistics>), BenchError> {
        let plan = self.plan(rng).await?;
        let statistics = self.execute(&plan, scope, rng).await?;
        Ok((plan, statistics))
    }

    /// Resolves the target node and picks one shard node per shard.
    ///
    /// Performs registry reads only; nothing is provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Discovery`] when the registry cannot be read or
    /// no target node qualifies, and [`BenchError::InsufficientNodes`] when
    /// fewer shard-eligible nodes exist than shards requested.
    pub async fn plan<G: Rng + ?Sized>(&self, rng: &mut G) -> Result<Plan, BenchError> {
        let window = self.settings.heartbeat_window;
        let node = if let Some(node) = &self.settings.node {
            node.clone()
        } else {
            select_node(&self.registry, window, rng)
                .await
                .map_err(BenchError::Discovery)?
        };
        info!(node = %node, "using node");

        let shards = &self.settings.shards;
        let mut candidates = self
            .registry
            .list_nodes(&[
                NodeFilter::recently_active(window),
                NodeFilter::min_capacity(CapacityKind::Sru, shards.min_sru),
            ])
            .await
            .map_err(BenchError::Discovery)?;
        if candidates.len() < shards.count {
            return Err(BenchError::InsufficientNodes {
                required: shards.count,
                available: candidates.len(),
            });
        }

        shuffle_nodes(&mut candidates, rng);
        let shard_nodes = candidates
            .into_iter()
            .take(shards.count)
            .map(|candidate| candidate.id)
            .collect();
        Ok(Plan { node, shard_nodes })
    }

    /// Provisions every resource of `plan` and runs the trials.
    ///
    /// # Errors
    ///
    /// Returns the first [`BenchError`]; teardowns stay on `scope`. A scope
    /// that has already been unwound is rejected before anything is created.
    pub async fn execute<G: Rng + ?Sized>(
        &self,
        plan: &Plan,
        scope: &mut CleanupScope,
        rng: &mut G,
    ) -> Result<Vec<TrialStatistics>, BenchError> {
        if !scope.is_open() {
            return Err(CleanupError::NoCleanupContext {
                label: Step::Network.to_string(),
            }
            .into());
        }
        self.provisioner
            .identity()
            .map_err(|source| BenchError::Provision {
                step: Step::Identity,
                source,
            })?;
        self.provision_network(plan, scope).await?;
        self.open_tunnel(scope)?;
        let shards = self.provision_shards(plan, scope).await?;
        self.provision_compute(plan, &shards, scope).await?;
        self.run_trials(rng).await
    }

    async fn provision_network(&self, plan: &Plan, scope: &mut CleanupScope) -> Result<(), BenchError> {
        let network = &self.settings.network;
        let schema = self.settings.work_dir.join(NETWORK_SCHEMA);
        let wireguard = network
            .wireguard_dir
            .join(format!("{}.conf", network.tunnel_interface));
        let failed = |source| BenchError::Provision {
            step: Step::Network,
            source,
        };

        self.provisioner
            .generate_to(
                &schema,
                &[
                    "generate",
                    "network",
                    "create",
                    "--name",
                    &network.name,
                    "--cidr",
                    &network.cidr,
                ],
            )
            .map_err(failed)?;
        self.provisioner
            .generate(&[
                "generate",
                "--schema",
                schema.as_str(),
                "network",
                "add-node",
                "--node",
                &plan.node,
                "--subnet",
                &network.subnet,
            ])
            .map_err(failed)?;
        self.provisioner
            .generate_to(
                &wireguard,
                &[
                    "generate",
                    "--schema",
                    schema.as_str(),
                    "network",
                    "add-access",
                    "--node",
                    &plan.node,
                    "--subnet",
                    &network.access_subnet,
                    "--ip4",
                ],
            )
            .map_err(failed)?;

        let id = self.provisioner.provision(&schema, &plan.node).map_err(failed)?;
        self.register_release(scope, Step::Network, vec![id.clone()])?;
        self.converge(Step::Network, &[id], scope).await?;
        Ok(())
    }

    fn open_tunnel(&self, scope: &mut CleanupScope) -> Result<(), BenchError> {
        self.tunnel
            .up()
            .map_err(|err| BenchError::Tunnel(Box::new(err)))?;
        let tunnel = self.tunnel.clone();
        scope.register(Step::Tunnel.to_string(), move || tunnel.down())?;
        Ok(())
    }

    async fn provision_shards(
        &self,
        plan: &Plan,
        scope: &mut CleanupScope,
    ) -> Result<Vec<ShardEndpoint>, BenchError> {
        let shards = &self.settings.shards;
        let schema = self.settings.work_dir.join(SHARD_SCHEMA);
        let failed = |source| BenchError::Provision {
            step: Step::Shards,
            source,
        };

        let size = shards.size_gb.to_string();
        self.provisioner
            .generate_to(
                &schema,
                &[
                    "generate",
                    "storage",
                    "zdb",
                    "--size",
                    &size,
                    "--type",
                    "SSD",
                    "--mode",
                    "seq",
                    "--password",
                    &shards.password,
                ],
            )
            .map_err(failed)?;

        let set = self
            .provisioner
            .provision_set(&schema, plan.shard_nodes.iter().map(String::as_str))
            .map_err(failed)?;
        let ids = set.ids().to_vec();
        self.register_release(scope, Step::Shards, ids.clone())?;

        let results = self.converge(Step::Shards, &ids, scope).await?;
        results
            .into_iter()
            .map(|result| {
                result
                    .payload::<StoragePayload>()
                    .map(|payload| ShardEndpoint::from_payload(payload, &shards.password))
                    .map_err(BenchError::ShardPayload)
            })
            .collect()
    }

    async fn provision_compute(
        &self,
        plan: &Plan,
        shards: &[ShardEndpoint],
        scope: &mut CleanupScope,
    ) -> Result<(), BenchError> {
        let compute = &self.settings.compute;
        let schema = self.settings.work_dir.join(COMPUTE_SCHEMA);
        let failed = |source| BenchError::Provision {
            step: Step::Compute,
            source,
        };

        let envs = [
            format!("SHARDS={}", shard_list(shards)),
            format!("DATA={}", compute.distribution.data),
            format!("PARITY={}", compute.distribution.parity),
            format!("ACCESS_KEY={}", compute.access_key),
            format!("SECRET_KEY={}", compute.secret_key),
        ];
        let cpu = compute.cpu.to_string();
        let memory = compute.memory_mb.to_string();
        let mut args = vec![
            "generate",
            "container",
            "--flist",
            compute.flist.as_str(),
            "--entrypoint",
            COMPUTE_ENTRYPOINT,
        ];
        for env in &envs {
            args.extend(["--envs", env.as_str()]);
        }
        args.extend([
            "--cpu",
            cpu.as_str(),
            "--memory",
            memory.as_str(),
            "--ip",
            compute.ip.as_str(),
            "--network",
            self.settings.network.name.as_str(),
        ]);
        self.provisioner
            .generate_to(&schema, &args)
            .map_err(failed)?;

        let id = self.provisioner.provision(&schema, &plan.node).map_err(failed)?;
        self.register_release(scope, Step::Compute, vec![id.clone()])?;
        self.converge(Step::Compute, &[id], scope).await?;
        Ok(())
    }

    fn register_release(
        &self,
        scope: &mut CleanupScope,
        step: Step,
        ids: Vec<ReservationId>,
    ) -> Result<(), BenchError> {
        let provisioner = self.provisioner.clone();
        scope.register(step.to_string(), move || {
            info!(step = %step, reservations = ids.len(), "releasing reservations");
            provisioner.deprovision(&ids)
        })?;
        Ok(())
    }

    async fn converge(
        &self,
        step: Step,
        ids: &[ReservationId],
        scope: &CleanupScope,
    ) -> Result<Vec<ReservationResult>, BenchError> {
        info!(step = %step, reservations = ids.len(), "waiting for convergence");
        let results = self
            .registry
            .await_all(ids, &self.settings.poll, &scope.cancellation_token())
            .await
            .map_err(|source| BenchError::Converge { step, source })?;

        if let Some(failed) = results
            .iter()
            .find(|result| result.state != ReservationState::Ok)
        {
            return Err(BenchError::Deployment {
                step,
                id: failed.id.clone(),
                state: failed.state,
                message: failed.error_message.clone(),
            });
        }
        info!(step = %step, "converged");
        Ok(results)
    }

    async fn run_trials<G: Rng + ?Sized>(
        &self,
        rng: &mut G,
    ) -> Result<Vec<TrialStatistics>, BenchError> {
        let compute = &self.settings.compute;
        self.storage
            .configure(StorageEndpoint {
                host: &compute.ip,
                access_key: &compute.access_key,
                secret_key: &compute.secret_key,
            })
            .map_err(|err| BenchError::Workspace {
                path: self.storage.config_dir().to_path_buf(),
                message: err.to_string(),
            })?;
        self.storage
            .make_bucket()
            .await
            .map_err(BenchError::Bucket)?;

        let mut statistics = Vec::with_capacity(self.settings.trial_sizes_mb.len());
        for &size_mb in &self.settings.trial_sizes_mb {
            match self.run_trial(size_mb, rng).await {
                Ok(record) => statistics.push(record),
                Err(err) => error!(size_mb, error = %err, "trial failed; skipping"),
            }
        }
        Ok(statistics)
    }

    async fn run_trial<G: Rng + ?Sized>(
        &self,
        size_mb: u64,
        rng: &mut G,
    ) -> Result<TrialStatistics, TrialError> {
        let name = format!("random-{size_mb}MB-{}", uuid::Uuid::new_v4().simple());
        let local = self.settings.work_dir.join(&name);
        let downloaded = self.settings.work_dir.join(format!("{name}.download"));
        let file_error = |path: &Utf8PathBuf| {
            let path = path.to_string();
            move |source| TrialError::File { path, source }
        };

        let hash = write_random_file(&local, size_mb, rng).map_err(file_error(&local))?;
        info!(size_mb, file = %name, hash = %hash, "uploading file");

        let upload = self
            .storage
            .upload(&local)
            .await
            .map_err(|source| TrialError::Upload {
                path: local.to_string(),
                source,
            })?;
        info!(size_mb, duration = ?upload, "upload finished");

        let download = self
            .storage
            .download(&name, &downloaded)
            .await
            .map_err(|source| TrialError::Download {
                path: downloaded.to_string(),
                source,
            })?;
        info!(size_mb, duration = ?download, "download finished");

        let download_hash = hash_file(&downloaded).map_err(file_error(&downloaded))?;
        let hash_match = download_hash == hash;
        if hash_match {
            info!(size_mb, destination = %downloaded, "hash matches");
        } else {
            warn!(size_mb, destination = %downloaded, download_hash = %download_hash, "hash does not match");
        }

        Ok(TrialStatistics::new(size_mb, hash_match, upload, download))
    }
}
