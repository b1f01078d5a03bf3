//! Reservation lifecycle: schema generation, provisioning and deprovisioning
//! through the external provisioning tool.
//!
//! Provisioning is two-phase. The tool answers quickly with a parseable
//! "request accepted" line naming the new resource; convergence to `ok` or
//! `error` happens later and is tracked by [`crate::registry`]. This module
//! only handles the first phase.

use std::ffi::OsString;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::command::{CommandError, CommandRunner, run_checked};
use crate::files::write_file;

/// Prefix of the provisioning tool's output line naming the new resource.
pub const RESOURCE_LINE_PREFIX: &str = "Resource: ";

/// Default provisioning tool binary name.
pub const DEFAULT_TOOL_BIN: &str = "tfuser";

/// Opaque identifier of a reservation in the registry.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReservationId(String);

impl ReservationId {
    /// Wraps a raw identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Extracts the identifier from a resource URI, which names the
    /// reservation in its last path segment.
    ///
    /// Returns `None` when the URI has no non-empty segment.
    #[must_use]
    pub fn from_resource_uri(uri: &str) -> Option<Self> {
        uri.trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(Self::new)
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ReservationId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Returns the reservation named by the first line starting with
/// [`RESOURCE_LINE_PREFIX`], if any.
#[must_use]
pub fn parse_reservation_id(output: &str) -> Option<ReservationId> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(RESOURCE_LINE_PREFIX))
        .and_then(ReservationId::from_resource_uri)
}

/// Errors raised while managing reservations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when the user identity cannot be created.
    #[error("failed to create identity: {0}")]
    Identity(#[source] Box<CommandError>),
    /// Raised when schema generation fails.
    #[error("failed to generate schema ({args}): {source}")]
    Generate {
        /// Generator arguments, space separated.
        args: String,
        /// Underlying command failure.
        #[source]
        source: Box<CommandError>,
    },
    /// Raised when a generated schema cannot be written.
    #[error("failed to write {path}: {message}")]
    WriteSchema {
        /// Destination path.
        path: Utf8PathBuf,
        /// I/O error message.
        message: String,
    },
    /// Raised when the provisioning command itself fails.
    #[error("failed to provision '{schema}' on node {node}: {source}")]
    Provision {
        /// Schema that was being provisioned.
        schema: Utf8PathBuf,
        /// Target node.
        node: String,
        /// Underlying command failure.
        #[source]
        source: Box<CommandError>,
    },
    /// Raised when provisioning output does not name a resource.
    #[error("failed to extract resource from reservation ({schema}):\n{output}")]
    ProvisionParse {
        /// Schema that was being provisioned.
        schema: Utf8PathBuf,
        /// Full output of the provisioning command.
        output: String,
    },
    /// Raised when a reservation cannot be deleted.
    #[error("failed to delete reservation {id}: {source}")]
    Deprovision {
        /// Reservation that could not be deleted.
        id: ReservationId,
        /// Underlying command failure.
        #[source]
        source: Box<CommandError>,
    },
}

/// Settings for the provisioning tool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionerConfig {
    /// Path to the provisioning tool.
    pub tool_bin: String,
    /// Lease duration requested for every reservation (for example `1h`).
    pub duration: String,
    /// Identity seed file produced by [`Provisioner::identity`].
    pub seed_file: Utf8PathBuf,
}

/// Issues and releases reservations by driving the provisioning tool.
#[derive(Clone, Debug)]
pub struct Provisioner<R: CommandRunner> {
    config: ProvisionerConfig,
    runner: R,
}

impl<R: CommandRunner> Provisioner<R> {
    /// Creates a provisioner using the supplied configuration and runner.
    #[must_use]
    pub const fn new(config: ProvisionerConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Creates the user identity (seed file) used to sign reservations.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Identity`] when the tool fails.
    pub fn identity(&self) -> Result<(), LifecycleError> {
        self.tool(&["id"]).map(drop).map_err(|err| LifecycleError::Identity(Box::new(err)))
    }

    /// Runs a schema generator subcommand and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Generate`] when the tool fails.
    pub fn generate(&self, args: &[&str]) -> Result<String, LifecycleError> {
        self.tool(args).map_err(|source| LifecycleError::Generate {
            args: args.join(" "),
            source: Box::new(source),
        })
    }

    /// Runs a schema generator subcommand and writes its output to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Generate`] when the tool fails and
    /// [`LifecycleError::WriteSchema`] when the file cannot be written.
    pub fn generate_to(&self, path: &Utf8Path, args: &[&str]) -> Result<(), LifecycleError> {
        let schema = self.generate(args)?;
        write_file(path, schema).map_err(|err| LifecycleError::WriteSchema {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Submits `schema` for placement on `node` and returns the new
    /// reservation identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provision`] when the tool fails and
    /// [`LifecycleError::ProvisionParse`] when its output names no resource.
    pub fn provision(&self, schema: &Utf8Path, node: &str) -> Result<ReservationId, LifecycleError> {
        let output = self
            .tool(&[
                "provision",
                "--schema",
                schema.as_str(),
                "--duration",
                &self.config.duration,
                "--seed",
                self.config.seed_file.as_str(),
                "--node",
                node,
            ])
            .map_err(|source| LifecycleError::Provision {
                schema: schema.to_path_buf(),
                node: node.to_owned(),
                source: Box::new(source),
            })?;

        let id = parse_reservation_id(&output).ok_or_else(|| LifecycleError::ProvisionParse {
            schema: schema.to_path_buf(),
            output: output.clone(),
        })?;
        info!(reservation = %id, %schema, node, "reservation accepted");
        Ok(id)
    }

    /// Deletes each reservation in order.
    ///
    /// Stops at the first failure; reservations after the failing one are
    /// not attempted, so callers must treat partial deprovisioning as
    /// possible.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Deprovision`] for the first reservation that
    /// cannot be deleted.
    pub fn deprovision(&self, ids: &[ReservationId]) -> Result<(), LifecycleError> {
        for id in ids {
            debug!(reservation = %id, "deleting reservation");
            self.tool(&["delete", "--id", id.as_str()])
                .map_err(|source| LifecycleError::Deprovision {
                    id: id.clone(),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    /// Provisions `schema` once per node as an all-or-nothing set.
    ///
    /// When any submission fails, the reservations already accepted are
    /// rolled back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first provisioning error.
    pub fn provision_set<'n, I>(
        &self,
        schema: &Utf8Path,
        nodes: I,
    ) -> Result<ReservationSet, LifecycleError>
    where
        I: IntoIterator<Item = &'n str>,
    {
        let mut set = ReservationSet::default();
        for node in nodes {
            match self.provision(schema, node) {
                Ok(id) => set.push(id),
                Err(err) => {
                    set.rollback(self);
                    return Err(err);
                }
            }
        }
        Ok(set)
    }

    fn tool(&self, args: &[&str]) -> Result<String, CommandError> {
        let args = args.iter().map(OsString::from).collect::<Vec<_>>();
        run_checked(&self.runner, &self.config.tool_bin, &args)
    }
}

/// Ordered reservations sharing one lifecycle: all must converge for the set
/// to be usable, and a failure releases the whole set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReservationSet {
    ids: Vec<ReservationId>,
}

impl ReservationSet {
    /// Appends a reservation to the set.
    pub fn push(&mut self, id: ReservationId) {
        self.ids.push(id);
    }

    /// Returns the reservations in provisioning order.
    #[must_use]
    pub fn ids(&self) -> &[ReservationId] {
        &self.ids
    }

    /// Returns the number of reservations in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` when the set holds no reservations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Releases every reservation in the set and empties it.
    ///
    /// Best effort: the first deprovisioning failure is logged and ends the
    /// rollback, leaving later reservations in place.
    pub fn rollback<R: CommandRunner>(&mut self, provisioner: &Provisioner<R>) {
        let ids = std::mem::take(&mut self.ids);
        if ids.is_empty() {
            return;
        }
        info!(reservations = ids.len(), "rolling back reservation set");
        if let Err(err) = provisioner.deprovision(&ids) {
            error!(error = %err, "failed to roll back reservation set");
        }
    }
}
