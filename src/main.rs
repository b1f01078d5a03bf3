//! Binary entry point for the `gridbench` CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};

use gridbench::bench::{BenchDriver, StorageClient, Tunnel, write_statistics};
use gridbench::files::open_dir;
use gridbench::{
    BenchConfig, BenchError, BenchOverrides, ConfigError, ProcessCommandRunner, Provisioner,
    RegistryClient, RegistryError, ResilientInvoker, StreamingCommandRunner, logging,
};

mod cli;

use cli::Cli;

/// Subdirectory of the work directory holding the storage client
/// configuration.
const STORAGE_CLIENT_DIR: &str = "mc";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("work directory error: {0}")]
    Workspace(String),
    #[error("benchmark failed: {0}")]
    Bench(#[from] BenchError),
    #[error("failed to write statistics to {path}: {message}")]
    Statistics { path: Utf8PathBuf, message: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init() {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn overrides(cli: Cli) -> BenchOverrides {
    let Cli {
        tool,
        storage_client,
        node,
        shards,
        distribution,
        registry,
        output,
    } = cli;
    BenchOverrides {
        tool,
        storage_client,
        node,
        shards,
        distribution,
        registry,
        output,
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = BenchConfig::load_without_cli_args()?.apply_overrides(overrides(cli));
    config.validate()?;

    let launch_dir = current_dir()?;
    let config = resolve_binaries(&launch_dir, config);
    let output = resolve_output(&launch_dir, &config.output);
    let work = WorkDir::create(&temp_root()?)?;
    env::set_current_dir(work.path()).map_err(|err| CliError::Workspace(err.to_string()))?;
    info!(work_dir = %work.path(), "entered work directory");

    let outcome = benchmark(&config, work.path()).await;

    if let Err(err) = env::set_current_dir(&launch_dir) {
        warn!(error = %err, "failed to return to the launch directory");
    }
    if let Err(err) = work.remove() {
        warn!(error = %err, "failed to remove work directory");
    }

    let statistics = outcome?;
    write_statistics(&output, &statistics).map_err(|err| CliError::Statistics {
        path: output.clone(),
        message: err.to_string(),
    })?;
    info!(path = %output, trials = statistics.len(), "statistics written");
    Ok(())
}

async fn benchmark(
    config: &BenchConfig,
    work_dir: &Utf8Path,
) -> Result<Vec<gridbench::TrialStatistics>, CliError> {
    let settings = config.settings(work_dir)?;
    let provisioner = Provisioner::new(config.provisioner_config(work_dir), ProcessCommandRunner);
    let tunnel = Tunnel::new(
        config.tunnel_bin.clone(),
        config.tunnel_interface.clone(),
        ProcessCommandRunner,
    );
    let storage = StorageClient::new(
        config.storage_client_bin.clone(),
        work_dir.join(STORAGE_CLIENT_DIR),
        ResilientInvoker::new(StreamingCommandRunner, config.retry_policy()),
    );
    let registry = RegistryClient::http(&config.registry_url)?;

    let driver = BenchDriver::new(provisioner, tunnel, registry, storage, settings);
    let report = driver.run(&mut rand::rng()).await?;
    Ok(report.statistics)
}

fn current_dir() -> Result<Utf8PathBuf, CliError> {
    let cwd = env::current_dir().map_err(|err| CliError::Workspace(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Workspace(format!("non UTF-8 path {}", path.display())))
}

fn temp_root() -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(env::temp_dir())
        .map_err(|path| CliError::Workspace(format!("non UTF-8 path {}", path.display())))
}

/// Resolves `output` against the directory the binary was launched from.
fn resolve_output(launch_dir: &Utf8Path, output: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(output);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        launch_dir.join(path)
    }
}

/// Anchors tool paths such as `./tfuser` to the launch directory so they
/// survive the change into the work directory. Bare names are left for
/// `PATH` lookup.
fn resolve_binary(launch_dir: &Utf8Path, bin: &str) -> String {
    let path = Utf8Path::new(bin);
    let has_dir = path.parent().is_some_and(|parent| !parent.as_str().is_empty());
    if has_dir && path.is_relative() {
        launch_dir.join(path).into_string()
    } else {
        bin.to_owned()
    }
}

fn resolve_binaries(launch_dir: &Utf8Path, config: BenchConfig) -> BenchConfig {
    BenchConfig {
        tool_bin: resolve_binary(launch_dir, &config.tool_bin),
        storage_client_bin: resolve_binary(launch_dir, &config.storage_client_bin),
        tunnel_bin: resolve_binary(launch_dir, &config.tunnel_bin),
        ..config
    }
}

/// Uniquely named directory the run works in, removed afterwards.
#[derive(Debug)]
struct WorkDir {
    root: Utf8PathBuf,
    name: String,
    path: Utf8PathBuf,
}

impl WorkDir {
    fn create(root: &Utf8Path) -> Result<Self, CliError> {
        let name = format!("gridbench-{}", uuid::Uuid::new_v4().simple());
        open_dir(root)
            .and_then(|dir| dir.create_dir(&name))
            .map_err(|err| CliError::Workspace(format!("{}: {err}", root.join(&name))))?;
        Ok(Self {
            root: root.to_path_buf(),
            path: root.join(&name),
            name,
        })
    }

    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn remove(self) -> io::Result<()> {
        open_dir(&self.root)?.remove_dir_all(&self.name)
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
