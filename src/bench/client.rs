//! Object-storage client wrapper.
//!
//! Every call goes through the [`ResilientInvoker`]: the storage server has
//! usually just booted when the trials start, so the first calls are expected
//! to fail until it accepts connections.

use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tracing::debug;

use crate::command::CommandRunner;
use crate::files::{open_dir, split_path};
use crate::retry::{ResilientInvoker, RetryError};

/// Default storage client binary.
pub const DEFAULT_STORAGE_CLIENT_BIN: &str = "mc";

/// Host alias under which the storage server is configured.
pub const HOST_ALIAS: &str = "test";

/// Bucket used by every trial.
pub const BUCKET: &str = "test/bucket";

/// Name of the client configuration file inside its configuration directory.
pub const CONFIG_FILE: &str = "config.json";

const S3_PORT: u16 = 9000;

/// Credentials and address of the storage server.
#[derive(Clone, Copy, Debug)]
pub struct StorageEndpoint<'a> {
    /// Address of the server.
    pub host: &'a str,
    /// Access key.
    pub access_key: &'a str,
    /// Secret key.
    pub secret_key: &'a str,
}

/// Drives the storage client CLI against the benchmark bucket.
#[derive(Clone, Debug)]
pub struct StorageClient<C: CommandRunner> {
    bin: String,
    config_dir: Utf8PathBuf,
    invoker: ResilientInvoker<C>,
}

impl<C: CommandRunner> StorageClient<C> {
    /// Creates a client that keeps its configuration under `config_dir`.
    #[must_use]
    pub const fn new(bin: String, config_dir: Utf8PathBuf, invoker: ResilientInvoker<C>) -> Self {
        Self {
            bin,
            config_dir,
            invoker,
        }
    }

    /// Returns the configuration directory.
    #[must_use]
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    /// Writes the client configuration pointing [`HOST_ALIAS`] at
    /// `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while creating the directory or writing
    /// the file.
    pub fn configure(&self, endpoint: StorageEndpoint<'_>) -> io::Result<()> {
        let config = json!({
            "version": "9",
            "hosts": {
                HOST_ALIAS: {
                    "url": format!("http://{}:{S3_PORT}", endpoint.host),
                    "accessKey": endpoint.access_key,
                    "secretKey": endpoint.secret_key,
                    "api": "s3v4",
                    "lookup": "auto",
                }
            }
        });
        let rendered = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;

        let (parent, name) = split_path(&self.config_dir)?;
        let root = open_dir(&parent)?;
        root.create_dir_all(&name)?;
        root.open_dir(&name)?.write(CONFIG_FILE, rendered)
    }

    /// Creates [`BUCKET`].
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when every attempt fails.
    pub async fn make_bucket(&self) -> Result<Duration, RetryError> {
        self.invoke(&["mb", BUCKET]).await
    }

    /// Uploads `local` into [`BUCKET`] under its file name and returns the
    /// duration of the successful attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when every attempt fails.
    pub async fn upload(&self, local: &Utf8Path) -> Result<Duration, RetryError> {
        self.invoke(&["cp", local.as_str(), BUCKET]).await
    }

    /// Downloads object `name` from [`BUCKET`] to `dest` and returns the
    /// duration of the successful attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when every attempt fails.
    pub async fn download(&self, name: &str, dest: &Utf8Path) -> Result<Duration, RetryError> {
        let object = format!("{BUCKET}/{name}");
        self.invoke(&["cp", &object, dest.as_str()]).await
    }

    async fn invoke(&self, args: &[&str]) -> Result<Duration, RetryError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push(OsString::from("-C"));
        full.push(OsString::from(self.config_dir.as_str()));
        full.extend(args.iter().map(OsString::from));

        debug!(command = %args.join(" "), "running storage client");
        let timed = self.invoker.invoke(&self.bin, &full).await?;
        Ok(timed.elapsed)
    }
}
