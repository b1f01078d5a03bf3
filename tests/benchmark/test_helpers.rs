//! Shared fixtures for benchmark BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use gridbench::bench::{
    BenchDriver, BenchSettings, ComputeSettings, Distribution, NetworkSettings, ShardSettings,
    StorageClient, Tunnel,
};
use gridbench::test_support::{FakeGrid, LocalBucket, ScriptedRegistry, node, unix_now};
use gridbench::{
    PollPolicy, Provisioner, ProvisionerConfig, RegistryClient, ResilientInvoker, RetryPolicy,
};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

pub type TestDriver = BenchDriver<FakeGrid, LocalBucket, ScriptedRegistry>;

#[derive(Clone, Debug)]
pub struct BenchContext {
    pub grid: FakeGrid,
    pub bucket: LocalBucket,
    pub work_dir: Utf8PathBuf,
    pub outcome: Option<BenchResult>,
    _work: Arc<TempDir>,
    _objects: Arc<TempDir>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BenchFailureKind {
    InsufficientNodes,
    Provision,
    Deployment,
    Timeout,
    Tunnel,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchFailure {
    pub kind: BenchFailureKind,
    pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchSuccess {
    pub trials: Vec<(u64, bool)>,
    pub teardown_failures: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BenchResult {
    Success(BenchSuccess),
    Failure(BenchFailure),
}

#[derive(Debug, Error)]
pub enum BenchTestError {
    #[error("invalid benchmark fixture: {0}")]
    Fixture(String),
}

pub type BenchContextResult = Result<BenchContext, BenchTestError>;

#[fixture]
pub fn bench_context_result() -> BenchContextResult {
    build_bench_context()
}

#[fixture]
pub fn bench_context(bench_context_result: BenchContextResult) -> BenchContext {
    bench_context_result
        .unwrap_or_else(|err| panic!("benchmark context fixture should initialise: {err}"))
}

fn temp_dir(label: &str) -> Result<TempDir, BenchTestError> {
    TempDir::new().map_err(|err| BenchTestError::Fixture(format!("{label}: {err}")))
}

fn build_bench_context() -> BenchContextResult {
    let work = temp_dir("work directory")?;
    let objects = temp_dir("object directory")?;
    let work_dir = Utf8PathBuf::from_path_buf(work.path().to_path_buf())
        .map_err(|path| BenchTestError::Fixture(format!("non UTF-8 path {}", path.display())))?;

    Ok(BenchContext {
        grid: FakeGrid::new(ScriptedRegistry::new()),
        bucket: LocalBucket::new(objects.path()),
        work_dir,
        outcome: None,
        _work: Arc::new(work),
        _objects: Arc::new(objects),
    })
}

impl BenchContext {
    pub fn set_eligible_nodes(&self, count: usize) {
        let now = unix_now();
        self.grid.registry().set_nodes(
            (0..count)
                .map(|index| node(&format!("shard-node-{index}"), now, 100, true))
                .collect(),
        );
    }

    pub fn settings(&self) -> BenchSettings {
        BenchSettings {
            node: Some(String::from("target")),
            heartbeat_window: Duration::from_secs(600),
            work_dir: self.work_dir.clone(),
            poll: PollPolicy {
                interval: Duration::from_millis(1),
                max_polls: 3,
            },
            trial_sizes_mb: vec![1, 2],
            network: NetworkSettings {
                name: String::from("minio"),
                cidr: String::from("172.10.0.0/16"),
                subnet: String::from("172.10.1.0/24"),
                access_subnet: String::from("10.1.0.0/24"),
                tunnel_interface: String::from("miniotest"),
                wireguard_dir: self.work_dir.clone(),
            },
            shards: ShardSettings {
                count: 3,
                size_gb: 10,
                password: String::from("password"),
                min_sru: 10,
            },
            compute: ComputeSettings {
                ip: String::from("172.10.1.100"),
                flist: String::from("https://hub.test/minio.flist"),
                cpu: 2,
                memory_mb: 4096,
                access_key: String::from("minio"),
                secret_key: String::from("passwordpassword"),
                distribution: Distribution::default(),
            },
        }
    }

    pub fn driver(&self) -> TestDriver {
        let settings = self.settings();
        let provisioner = Provisioner::new(
            ProvisionerConfig {
                tool_bin: String::from("tfuser"),
                duration: String::from("1h"),
                seed_file: self.work_dir.join("user.seed"),
            },
            self.grid.clone(),
        );
        let tunnel = Tunnel::new(
            String::from("wg-quick"),
            settings.network.tunnel_interface.clone(),
            self.grid.clone(),
        );
        let storage = StorageClient::new(
            String::from("mc"),
            self.work_dir.join("mc"),
            ResilientInvoker::new(
                self.bucket.clone(),
                RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            ),
        );
        BenchDriver::new(
            provisioner,
            tunnel,
            RegistryClient::new(self.grid.registry()),
            storage,
            settings,
        )
    }
}
