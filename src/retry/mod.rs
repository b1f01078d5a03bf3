//! Exponential-backoff retries for flaky client invocations.
//!
//! Only the benchmark phase retries: the storage client talks to a freshly
//! booted object-storage server and is expected to fail transiently for a
//! while. Provisioning and registry calls never pass through here.

use std::ffi::OsString;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::command::{CommandError, CommandOutput, CommandRunner};

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: u32 = 2;

/// Bounds for a retried invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound applied to every computed delay.
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failed attempt.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default growth factor.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Output of a successful invocation together with how long it took.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Timed<T> {
    /// Value produced by the successful attempt.
    pub output: T,
    /// Wall-clock duration of the successful attempt alone.
    pub elapsed: Duration,
}

/// Report handed to the observer after each failed attempt that will be
/// retried.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttemptFailure {
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// Wall-clock duration of the failed attempt.
    pub elapsed: Duration,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Error produced by the attempt.
    pub error: CommandError,
}

/// Errors raised by the resilient invoker.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RetryError {
    /// Raised when every attempt failed; wraps the last underlying error.
    #[error("{program} failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Program that was retried.
        program: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: Box<CommandError>,
    },
    /// Raised when the policy allows no attempts at all.
    #[error("retry policy must allow at least one attempt")]
    NoAttempts,
}

/// Wraps a [`CommandRunner`] with bounded exponential backoff.
#[derive(Clone, Debug)]
pub struct ResilientInvoker<R: CommandRunner> {
    runner: R,
    policy: RetryPolicy,
}

impl<R: CommandRunner> ResilientInvoker<R> {
    /// Creates an invoker using the supplied runner and policy.
    #[must_use]
    pub const fn new(runner: R, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    /// Runs `program` until it exits successfully, logging each failed
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] when every attempt fails.
    pub async fn invoke(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<Timed<CommandOutput>, RetryError> {
        self.invoke_with(program, args, |failure| {
            warn!(
                program,
                attempt = failure.attempt,
                elapsed = ?failure.elapsed,
                delay = ?failure.delay,
                error = %failure.error,
                "attempt failed; retrying"
            );
        })
        .await
    }

    /// Runs `program` until it exits successfully, reporting every failed
    /// attempt that will be retried to `observer`.
    ///
    /// The observer is informational only; it cannot stop the retry loop.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] wrapping the last underlying error
    /// when every attempt fails, or [`RetryError::NoAttempts`] when the
    /// policy allows zero attempts.
    pub async fn invoke_with<F>(
        &self,
        program: &str,
        args: &[OsString],
        mut observer: F,
    ) -> Result<Timed<CommandOutput>, RetryError>
    where
        F: FnMut(&AttemptFailure),
    {
        if self.policy.max_attempts == 0 {
            return Err(RetryError::NoAttempts);
        }

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = self
                .runner
                .run(program, args)
                .and_then(|output| output.check(program));
            let elapsed = started.elapsed();

            let error = match result {
                Ok(output) => return Ok(Timed { output, elapsed }),
                Err(error) => error,
            };

            if attempt >= self.policy.max_attempts {
                return Err(RetryError::Exhausted {
                    program: program.to_owned(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.policy.delay_after(attempt);
            observer(&AttemptFailure {
                attempt,
                elapsed,
                delay,
                error,
            });
            sleep(delay).await;
            attempt += 1;
        }
    }
}
