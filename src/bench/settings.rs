//! Resolved inputs of a benchmark run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::registry::PollPolicy;

/// Errors raised while parsing a data/parity distribution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid data/parity distribution '{value}': {reason}")]
pub struct DistributionError {
    /// Rejected input.
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// Erasure-coding split of the storage server: data shards per parity
/// shard, written as `D/P`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Distribution {
    /// Number of data shards.
    pub data: u32,
    /// Number of parity shards.
    pub parity: u32,
}

impl Default for Distribution {
    fn default() -> Self {
        Self { data: 2, parity: 1 }
    }
}

impl FromStr for Distribution {
    type Err = DistributionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let reject = |reason| DistributionError {
            value: value.to_owned(),
            reason,
        };
        let (data, parity) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| reject("expected D/P"))?;
        let data = data
            .trim()
            .parse::<u32>()
            .map_err(|_| reject("data is not a number"))?;
        let parity = parity
            .trim()
            .parse::<u32>()
            .map_err(|_| reject("parity is not a number"))?;
        if data == 0 || parity == 0 {
            return Err(reject("neither data nor parity can be zero"));
        }
        Ok(Self { data, parity })
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.data, self.parity)
    }
}

/// Private network and local tunnel settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkSettings {
    /// Network name, shared by the compute workload.
    pub name: String,
    /// Full network range.
    pub cidr: String,
    /// Subnet assigned to the target node.
    pub subnet: String,
    /// Subnet of the local access point.
    pub access_subnet: String,
    /// Tunnel interface name passed to `wg-quick`.
    pub tunnel_interface: String,
    /// Directory `wg-quick` reads interface configurations from.
    pub wireguard_dir: Utf8PathBuf,
}

/// Storage shard settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShardSettings {
    /// Number of shards, one per node.
    pub count: usize,
    /// Size of each shard in GiB.
    pub size_gb: u32,
    /// Namespace password shared by every shard.
    pub password: String,
    /// Nodes must advertise strictly more SSD units than this.
    pub min_sru: u64,
}

/// Compute workload settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeSettings {
    /// Address of the workload inside the private network.
    pub ip: String,
    /// Image of the object-storage server.
    pub flist: String,
    /// Virtual CPUs.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Object-storage access key.
    pub access_key: String,
    /// Object-storage secret key.
    pub secret_key: String,
    /// Data/parity split across the shards.
    pub distribution: Distribution,
}

/// Everything the driver needs to run one benchmark.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchSettings {
    /// Target node for the network and compute workload; discovered when
    /// absent.
    pub node: Option<String>,
    /// Maximum heartbeat age of eligible nodes.
    pub heartbeat_window: Duration,
    /// Directory holding schemas, test files and client configuration.
    pub work_dir: Utf8PathBuf,
    /// Polling budget for every convergence wait.
    pub poll: PollPolicy,
    /// Sizes of the upload/download trials, in MiB.
    pub trial_sizes_mb: Vec<u64>,
    /// Network settings.
    pub network: NetworkSettings,
    /// Shard settings.
    pub shards: ShardSettings,
    /// Compute settings.
    pub compute: ComputeSettings,
}
