//! Core library for the `gridbench` storage benchmark.
//!
//! The crate provisions a private network, a set of storage shards and a
//! storage server on a leased grid, measures upload and download round trips
//! through an object-storage client and releases every reservation again,
//! in reverse order, whichever step failed.

pub mod bench;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod files;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod test_support;

pub use bench::{BenchDriver, BenchError, BenchReport, BenchSettings, TrialStatistics};
pub use cleanup::{CleanupError, CleanupScope, UnwindReport};
pub use command::{
    CommandError, CommandOutput, CommandRunner, ProcessCommandRunner, StreamingCommandRunner,
};
pub use config::{BenchConfig, BenchOverrides, ConfigError};
pub use lifecycle::{LifecycleError, Provisioner, ProvisionerConfig, ReservationId, ReservationSet};
pub use registry::{HttpRegistry, PollPolicy, RegistryApi, RegistryClient, RegistryError};
pub use retry::{ResilientInvoker, RetryError, RetryPolicy};
