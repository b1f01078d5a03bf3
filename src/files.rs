//! Capability-scoped file helpers shared by the provisioning and benchmark
//! steps.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Opens the directory at `path` with ambient authority.
///
/// # Errors
///
/// Returns the underlying I/O error when the directory cannot be opened.
pub fn open_dir(path: &Utf8Path) -> io::Result<Dir> {
    Dir::open_ambient_dir(path, ambient_authority())
}

/// Splits `path` into its parent directory and file name.
///
/// A bare file name resolves against the current directory.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] when `path` has no file name.
pub fn split_path(path: &Utf8Path) -> io::Result<(Utf8PathBuf, String)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} does not name a file"),
        )
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map_or_else(|| Utf8PathBuf::from("."), Utf8Path::to_path_buf);
    Ok((parent, name.to_owned()))
}

/// Writes `contents` to `path`, replacing any existing file.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent directory cannot be
/// opened or the file cannot be written.
pub fn write_file(path: &Utf8Path, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let (parent, name) = split_path(path)?;
    open_dir(&parent)?.write(name, contents)
}
