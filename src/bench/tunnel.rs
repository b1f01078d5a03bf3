//! Local point-to-point tunnel into the private network.

use std::ffi::OsString;

use tracing::info;

use crate::command::{CommandError, CommandRunner, run_checked};

/// Default tunnel tool.
pub const DEFAULT_TUNNEL_BIN: &str = "wg-quick";

/// Brings a `wg-quick` interface up and down.
#[derive(Clone, Debug)]
pub struct Tunnel<R: CommandRunner> {
    bin: String,
    interface: String,
    runner: R,
}

impl<R: CommandRunner> Tunnel<R> {
    /// Creates a handle for `interface`, driven through `bin`.
    #[must_use]
    pub const fn new(bin: String, interface: String, runner: R) -> Self {
        Self {
            bin,
            interface,
            runner,
        }
    }

    /// Brings the interface up.
    ///
    /// # Errors
    ///
    /// Returns the [`CommandError`] reported by the tunnel tool.
    pub fn up(&self) -> Result<(), CommandError> {
        self.toggle("up")?;
        info!(interface = %self.interface, "tunnel is up");
        Ok(())
    }

    /// Brings the interface down.
    ///
    /// # Errors
    ///
    /// Returns the [`CommandError`] reported by the tunnel tool.
    pub fn down(&self) -> Result<(), CommandError> {
        self.toggle("down")?;
        info!(interface = %self.interface, "tunnel is down");
        Ok(())
    }

    fn toggle(&self, direction: &str) -> Result<(), CommandError> {
        let args = [OsString::from(direction), OsString::from(&self.interface)];
        run_checked(&self.runner, &self.bin, &args).map(drop)
    }
}
