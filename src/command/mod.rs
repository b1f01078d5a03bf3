//! External program execution behind a swappable runner.
//!
//! Every collaborator the harness drives (the provisioning tool, the storage
//! client, `wg-quick`) is an opaque subprocess. The [`CommandRunner`] trait is
//! the single seam through which they are executed so tests can replay
//! scripted outputs instead of spawning processes.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns the output unchanged when the exit code is zero.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Execution`] carrying the captured streams when
    /// the process did not exit with status zero.
    pub fn check(self, program: &str) -> Result<Self, CommandError> {
        if self.is_success() {
            return Ok(self);
        }

        let status_text = self
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(CommandError::Execution {
            program: program.to_owned(),
            status: self.code,
            status_text,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }

    /// Converts the output into its stdout, failing on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Execution`] when the process did not exit with
    /// status zero.
    pub fn into_stdout(self, program: &str) -> Result<String, CommandError> {
        self.check(program).map(|output| output.stdout)
    }
}

/// Errors raised while executing an external program.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Execution {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stdout captured from the process.
        stdout: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// A non-zero exit is not an error at this level; callers inspect
    /// [`CommandOutput::code`] or use [`run_checked`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }
}

/// Runs `program` and returns its stdout when it exits with status zero.
///
/// # Errors
///
/// Returns [`CommandError::Spawn`] when the process cannot start and
/// [`CommandError::Execution`] when it exits unsuccessfully.
pub fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
) -> Result<String, CommandError> {
    runner.run(program, args)?.into_stdout(program)
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Command runner that forwards child output to the terminal as it arrives
/// while still capturing it.
///
/// Used for the storage client, whose progress output is worth watching
/// during long transfers.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(program, &err))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = thread::spawn(move || tee(stdout_pipe, io::stdout()));
        let stderr_handle = thread::spawn(move || tee(stderr_pipe, io::stderr()));

        let waited = child.wait();
        let reaped = reap_on_error(&mut child, waited);
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let status = reaped.map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Kills and reaps `child` when waiting on it failed, so its pipes close and
/// the tee threads can finish.
fn reap_on_error(child: &mut Child, waited: io::Result<ExitStatus>) -> io::Result<ExitStatus> {
    if waited.is_err() {
        child.kill().ok();
        child.wait().ok();
    }
    waited
}

fn tee<R: Read, W: Write>(source: Option<R>, mut sink: W) -> Vec<u8> {
    let mut captured = Vec::new();
    let Some(mut reader) = source else {
        return captured;
    };

    let mut buffer = [0_u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let chunk = buffer.get(..read).unwrap_or_default();
                sink.write_all(chunk).ok();
                sink.flush().ok();
                captured.extend_from_slice(chunk);
            }
        }
    }
    captured
}

fn spawn_error(program: &str, err: &io::Error) -> CommandError {
    CommandError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}
