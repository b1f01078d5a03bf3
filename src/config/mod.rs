//! Configuration loading via `ortho-config`.
//!
//! [`BenchConfig`] merges defaults, `gridbench.toml` and `GRIDBENCH_*`
//! environment variables; [`BenchOverrides`] carries the command-line flags
//! applied on top.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::bench::{
    BenchSettings, ComputeSettings, DEFAULT_STORAGE_CLIENT_BIN, DEFAULT_TUNNEL_BIN, Distribution,
    NetworkSettings, ShardSettings,
};
use crate::lifecycle::{DEFAULT_TOOL_BIN, ProvisionerConfig};
use crate::registry::PollPolicy;
use crate::retry::RetryPolicy;

/// Default registry endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://explorer.devnet.grid.tf/";

/// Default storage server image.
pub const DEFAULT_COMPUTE_FLIST: &str = "https://hub.grid.tf/azmy.3bot/minio.flist";

/// Benchmark settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GRIDBENCH",
    discovery(
        app_name = "gridbench",
        env_var = "GRIDBENCH_CONFIG_PATH",
        config_file_name = "gridbench.toml",
        dotfile_name = ".gridbench.toml",
        project_file_name = "gridbench.toml"
    )
)]
pub struct BenchConfig {
    /// Path to the provisioning tool.
    #[ortho_config(skip_cli, default = DEFAULT_TOOL_BIN.to_owned())]
    pub tool_bin: String,
    /// Path to the object-storage client.
    #[ortho_config(skip_cli, default = DEFAULT_STORAGE_CLIENT_BIN.to_owned())]
    pub storage_client_bin: String,
    /// Path to the tunnel tool.
    #[ortho_config(skip_cli, default = DEFAULT_TUNNEL_BIN.to_owned())]
    pub tunnel_bin: String,
    /// Base URL of the registry HTTP API.
    #[ortho_config(skip_cli, default = DEFAULT_REGISTRY_URL.to_owned())]
    pub registry_url: String,
    /// Node hosting the network endpoint and compute workload. Discovered
    /// when absent.
    #[ortho_config(skip_cli)]
    pub node: Option<String>,
    /// Number of storage shards.
    #[ortho_config(skip_cli, default = 3)]
    pub shards: usize,
    /// Data/parity distribution, as `D/P`.
    #[ortho_config(skip_cli, default = "2/1".to_owned())]
    pub distribution: String,
    /// Lease duration requested for every reservation.
    #[ortho_config(skip_cli, default = "1h".to_owned())]
    pub provision_duration: String,
    /// Identity seed file, relative to the work directory unless absolute.
    #[ortho_config(skip_cli, default = "user.seed".to_owned())]
    pub seed_file: String,
    /// Maximum age of a node heartbeat, in seconds.
    #[ortho_config(skip_cli, default = 600)]
    pub heartbeat_window_secs: u64,
    /// Storage units a node must exceed to host a shard.
    #[ortho_config(skip_cli, default = 10)]
    pub shard_min_sru: u64,
    /// Delay between reservation polls, in milliseconds.
    #[ortho_config(skip_cli, default = 1000)]
    pub poll_interval_ms: u64,
    /// Polls per reservation before giving up.
    #[ortho_config(skip_cli, default = 20)]
    pub max_polls: u32,
    /// Storage client attempts per call.
    #[ortho_config(skip_cli, default = 10)]
    pub retry_max_attempts: u32,
    /// Delay after the first failed storage client attempt, in milliseconds.
    #[ortho_config(skip_cli, default = 500)]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    #[ortho_config(skip_cli, default = 10_000)]
    pub retry_max_delay_ms: u64,
    /// Comma-separated trial sizes in MiB.
    #[ortho_config(skip_cli, default = "10,100,1024".to_owned())]
    pub trial_sizes_mb: String,
    /// Statistics file, resolved against the launch directory.
    #[ortho_config(skip_cli, default = "statistics.json".to_owned())]
    pub output: String,
    /// Name of the private network.
    #[ortho_config(skip_cli, default = "minio".to_owned())]
    pub network_name: String,
    /// Address range of the private network.
    #[ortho_config(skip_cli, default = "172.10.0.0/16".to_owned())]
    pub network_cidr: String,
    /// Subnet assigned to the target node.
    #[ortho_config(skip_cli, default = "172.10.1.0/24".to_owned())]
    pub network_subnet: String,
    /// Subnet assigned to the local access point.
    #[ortho_config(skip_cli, default = "10.1.0.0/24".to_owned())]
    pub access_subnet: String,
    /// Local tunnel interface name.
    #[ortho_config(skip_cli, default = "miniotest".to_owned())]
    pub tunnel_interface: String,
    /// Directory the tunnel configuration is written to.
    #[ortho_config(skip_cli, default = "/etc/wireguard".to_owned())]
    pub wireguard_dir: String,
    /// Address of the compute workload inside the network.
    #[ortho_config(skip_cli, default = "172.10.1.100".to_owned())]
    pub compute_ip: String,
    /// Image of the storage server.
    #[ortho_config(skip_cli, default = DEFAULT_COMPUTE_FLIST.to_owned())]
    pub compute_flist: String,
    /// CPU cores of the compute workload.
    #[ortho_config(skip_cli, default = 2)]
    pub compute_cpu: u32,
    /// Memory of the compute workload, in MiB.
    #[ortho_config(skip_cli, default = 4096)]
    pub compute_memory_mb: u64,
    /// Access key of the storage server.
    #[ortho_config(skip_cli, default = "minio".to_owned())]
    pub access_key: String,
    /// Secret key of the storage server.
    #[ortho_config(skip_cli, default = "passwordpassword".to_owned())]
    pub secret_key: String,
    /// Size of each shard, in GB.
    #[ortho_config(skip_cli, default = 10)]
    pub shard_size_gb: u32,
    /// Namespace password of each shard.
    #[ortho_config(skip_cli, default = "password".to_owned())]
    pub shard_password: String,
}

/// Values supplied on the command line, applied over the loaded
/// configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BenchOverrides {
    /// Provisioning tool path.
    pub tool: Option<String>,
    /// Storage client path.
    pub storage_client: Option<String>,
    /// Target node.
    pub node: Option<String>,
    /// Shard count.
    pub shards: Option<usize>,
    /// Data/parity distribution.
    pub distribution: Option<String>,
    /// Registry base URL.
    pub registry: Option<String>,
    /// Statistics file.
    pub output: Option<String>,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value the benchmark cannot use.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

fn env_var(toml_key: &str) -> String {
    format!("GRIDBENCH_{}", toml_key.to_ascii_uppercase())
}

fn require_value(value: &str, description: &str, toml_key: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {description}: set {} or add {toml_key} to gridbench.toml",
            env_var(toml_key)
        )));
    }
    Ok(())
}

fn require_positive(value: u64, description: &str, toml_key: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{description} must be at least 1: check {} or {toml_key} in gridbench.toml",
            env_var(toml_key)
        )));
    }
    Ok(())
}

impl BenchConfig {
    /// Loads configuration using defaults, configuration files and
    /// environment variables, without parsing command-line arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gridbench")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies command-line values over the loaded ones.
    #[must_use]
    pub fn apply_overrides(mut self, overrides: BenchOverrides) -> Self {
        let BenchOverrides {
            tool,
            storage_client,
            node,
            shards,
            distribution,
            registry,
            output,
        } = overrides;
        if let Some(tool) = tool {
            self.tool_bin = tool;
        }
        if let Some(client) = storage_client {
            self.storage_client_bin = client;
        }
        if node.is_some() {
            self.node = node;
        }
        if let Some(shards) = shards {
            self.shards = shards;
        }
        if let Some(distribution) = distribution {
            self.distribution = distribution;
        }
        if let Some(registry) = registry {
            self.registry_url = registry;
        }
        if let Some(output) = output {
            self.output = output;
        }
        self
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that set the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is blank
    /// and [`ConfigError::Invalid`] when a value cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, description, key) in [
            (&self.tool_bin, "provisioning tool", "tool_bin"),
            (&self.storage_client_bin, "storage client", "storage_client_bin"),
            (&self.tunnel_bin, "tunnel tool", "tunnel_bin"),
            (&self.registry_url, "registry URL", "registry_url"),
            (&self.provision_duration, "lease duration", "provision_duration"),
            (&self.seed_file, "identity seed file", "seed_file"),
            (&self.output, "statistics file", "output"),
            (&self.network_name, "network name", "network_name"),
            (&self.network_cidr, "network range", "network_cidr"),
            (&self.network_subnet, "node subnet", "network_subnet"),
            (&self.access_subnet, "access subnet", "access_subnet"),
            (&self.tunnel_interface, "tunnel interface", "tunnel_interface"),
            (&self.wireguard_dir, "tunnel configuration directory", "wireguard_dir"),
            (&self.compute_ip, "compute address", "compute_ip"),
            (&self.compute_flist, "compute image", "compute_flist"),
            (&self.access_key, "storage access key", "access_key"),
            (&self.secret_key, "storage secret key", "secret_key"),
            (&self.shard_password, "shard password", "shard_password"),
        ] {
            require_value(value, description, key)?;
        }
        if let Some(node) = &self.node {
            require_value(node, "target node", "node")?;
        }

        require_positive(
            u64::try_from(self.shards).unwrap_or(u64::MAX),
            "shard count",
            "shards",
        )?;
        require_positive(u64::from(self.max_polls), "poll budget", "max_polls")?;
        require_positive(
            u64::from(self.retry_max_attempts),
            "storage client attempts",
            "retry_max_attempts",
        )?;
        self.distribution()?;
        self.trial_sizes()?;
        Ok(())
    }

    /// Parses the data/parity distribution.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not `D/P` with
    /// both parts non-zero.
    pub fn distribution(&self) -> Result<Distribution, ConfigError> {
        self.distribution.parse().map_err(|err| {
            ConfigError::Invalid(format!(
                "{err}: check --dist, {} or distribution in gridbench.toml",
                env_var("distribution")
            ))
        })
    }

    /// Parses the comma-separated trial sizes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a size is not a positive
    /// integer or no size is given.
    pub fn trial_sizes(&self) -> Result<Vec<u64>, ConfigError> {
        let invalid = |detail: String| {
            ConfigError::Invalid(format!(
                "{detail}: check {} or trial_sizes_mb in gridbench.toml",
                env_var("trial_sizes_mb")
            ))
        };
        let sizes = self
            .trial_sizes_mb
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.parse::<u64>() {
                Ok(size) if size > 0 => Ok(size),
                _ => Err(invalid(format!("trial size '{part}' is not a positive integer"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if sizes.is_empty() {
            return Err(invalid(String::from("no trial sizes configured")));
        }
        Ok(sizes)
    }

    /// Returns the registry polling budget.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
        }
    }

    /// Returns the storage client retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Returns the provisioning tool settings; a relative seed file lands in
    /// `work_dir`.
    #[must_use]
    pub fn provisioner_config(&self, work_dir: &Utf8Path) -> ProvisionerConfig {
        ProvisionerConfig {
            tool_bin: self.tool_bin.clone(),
            duration: self.provision_duration.clone(),
            seed_file: work_dir.join(&self.seed_file),
        }
    }

    /// Assembles the driver settings for a run rooted at `work_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the distribution or trial sizes
    /// do not parse.
    pub fn settings(&self, work_dir: &Utf8Path) -> Result<BenchSettings, ConfigError> {
        Ok(BenchSettings {
            node: self.node.clone(),
            heartbeat_window: Duration::from_secs(self.heartbeat_window_secs),
            work_dir: work_dir.to_path_buf(),
            poll: self.poll_policy(),
            trial_sizes_mb: self.trial_sizes()?,
            network: NetworkSettings {
                name: self.network_name.clone(),
                cidr: self.network_cidr.clone(),
                subnet: self.network_subnet.clone(),
                access_subnet: self.access_subnet.clone(),
                tunnel_interface: self.tunnel_interface.clone(),
                wireguard_dir: Utf8PathBuf::from(&self.wireguard_dir),
            },
            shards: ShardSettings {
                count: self.shards,
                size_gb: self.shard_size_gb,
                password: self.shard_password.clone(),
                min_sru: self.shard_min_sru,
            },
            compute: ComputeSettings {
                ip: self.compute_ip.clone(),
                flist: self.compute_flist.clone(),
                cpu: self.compute_cpu,
                memory_mb: self.compute_memory_mb,
                access_key: self.access_key.clone(),
                secret_key: self.secret_key.clone(),
                distribution: self.distribution()?,
            },
        })
    }
}
