//! Test files, content hashing and per-trial statistics.

use std::io::{self, Read, Write};
use std::time::Duration;

use camino::Utf8Path;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::files::{open_dir, split_path};
use crate::retry::RetryError;

const MIB: usize = 1024 * 1024;

/// Outcome of one upload/download trial, serialised as one line of the
/// statistics file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrialStatistics {
    /// Whether the downloaded content hashed identically to the upload.
    #[serde(rename = "hash-match")]
    pub hash_match: bool,
    /// Size of the test file in MiB.
    #[serde(rename = "size-mb")]
    pub size_mb: u64,
    /// Duration of the successful upload attempt, in nanoseconds.
    #[serde(rename = "upload-ns")]
    pub upload_ns: u64,
    /// Duration of the successful download attempt, in nanoseconds.
    #[serde(rename = "download-ns")]
    pub download_ns: u64,
}

impl TrialStatistics {
    /// Builds statistics from measured durations.
    #[must_use]
    pub fn new(size_mb: u64, hash_match: bool, upload: Duration, download: Duration) -> Self {
        Self {
            hash_match,
            size_mb,
            upload_ns: nanos(upload),
            download_ns: nanos(download),
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Errors that end a single trial without ending the run.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Raised when a test file cannot be written or read back.
    #[error("test file {path}: {source}")]
    File {
        /// File being processed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Raised when the upload never succeeds.
    #[error("failed to upload {path}: {source}")]
    Upload {
        /// File being uploaded.
        path: String,
        /// Retry failure.
        #[source]
        source: RetryError,
    },
    /// Raised when the download never succeeds.
    #[error("failed to download {path}: {source}")]
    Download {
        /// Destination of the download.
        path: String,
        /// Retry failure.
        #[source]
        source: RetryError,
    },
}

/// Writes `size_mb` MiB of random bytes to `path` and returns their
/// SHA-256 digest, computed while writing.
///
/// # Errors
///
/// Returns the I/O error raised while creating or writing the file.
pub fn write_random_file<G: Rng + ?Sized>(
    path: &Utf8Path,
    size_mb: u64,
    rng: &mut G,
) -> io::Result<String> {
    let (parent, name) = split_path(path)?;
    let mut file = open_dir(&parent)?.create(name)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0_u8; MIB];
    for _ in 0..size_mb {
        rng.fill_bytes(&mut chunk);
        hasher.update(&chunk);
        file.write_all(&chunk)?;
    }
    file.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

/// Returns the SHA-256 digest of the file at `path`.
///
/// # Errors
///
/// Returns the I/O error raised while opening or reading the file.
pub fn hash_file(path: &Utf8Path) -> io::Result<String> {
    let (parent, name) = split_path(path)?;
    let mut file = open_dir(&parent)?.open(name)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; MIB];
    loop {
        let read = file.read(&mut buffer)?;
        let Some(chunk) = buffer.get(..read).filter(|chunk| !chunk.is_empty()) else {
            break;
        };
        hasher.update(chunk);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes `statistics` to `path` as newline-delimited JSON.
///
/// # Errors
///
/// Returns the I/O error raised while writing the file.
pub fn write_statistics(path: &Utf8Path, statistics: &[TrialStatistics]) -> io::Result<()> {
    let mut rendered = String::new();
    for record in statistics {
        rendered.push_str(&serde_json::to_string(record).map_err(io::Error::other)?);
        rendered.push('\n');
    }
    crate::files::write_file(path, rendered)
}
