//! Command-line interface definitions for the `gridbench` binary.
//!
//! This module centralises the clap parser so both the main binary and the
//! build script can reuse it when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `gridbench` binary.
///
/// Every flag overrides the value loaded from `gridbench.toml` and the
/// `GRIDBENCH_*` environment variables.
#[derive(Debug, Parser)]
#[command(
    name = "gridbench",
    about = "Provision a sharded object store on the grid and benchmark uploads and downloads"
)]
pub(crate) struct Cli {
    /// Path to the provisioning tool.
    #[arg(long, value_name = "PATH")]
    pub(crate) tool: Option<String>,
    /// Path to the object-storage client.
    #[arg(long = "storage-client", value_name = "PATH")]
    pub(crate) storage_client: Option<String>,
    /// Node hosting the network and the storage server; discovered when
    /// omitted.
    #[arg(long, value_name = "NODE_ID")]
    pub(crate) node: Option<String>,
    /// Number of storage shards to provision.
    #[arg(long, value_name = "COUNT")]
    pub(crate) shards: Option<usize>,
    /// Data/parity distribution of the storage server, as D/P.
    #[arg(long = "dist", value_name = "D/P")]
    pub(crate) distribution: Option<String>,
    /// Base URL of the registry API.
    #[arg(long, value_name = "URL")]
    pub(crate) registry: Option<String>,
    /// File the per-trial statistics are written to.
    #[arg(long, value_name = "PATH")]
    pub(crate) output: Option<String>,
}
