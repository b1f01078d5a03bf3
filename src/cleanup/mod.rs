//! Lifecycle scope that owns teardown actions for one benchmark run.
//!
//! Every provisioning step registers the teardown of what it created on the
//! scope as soon as the creation call succeeds. Unwinding runs the actions in
//! strict reverse registration order, exactly once, and never stops on a
//! failing action.

use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type BoxedAction = Box<dyn FnOnce() -> Result<(), String>>;

/// Errors raised by [`CleanupScope`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CleanupError {
    /// Raised when an action is registered on a scope that has already been
    /// unwound. This is a programming defect and must not be retried.
    #[error("cannot register cleanup '{label}': scope has already been unwound")]
    NoCleanupContext {
        /// Label of the rejected action.
        label: String,
    },
}

/// Teardown that failed while unwinding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupFailure {
    /// Label of the failing action.
    pub label: String,
    /// Error reported by the action.
    pub message: String,
}

/// Outcome of [`CleanupScope::unwind_all`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnwindReport {
    /// Labels of the actions that ran, in execution order.
    pub ran: Vec<String>,
    /// Actions that reported an error.
    pub failed: Vec<CleanupFailure>,
}

impl UnwindReport {
    /// Returns `true` when every action succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct CleanupAction {
    label: String,
    run: BoxedAction,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScopeState {
    Open,
    Destroyed,
}

/// Caller-owned stack of teardown actions with a cancellation signal.
///
/// The scope moves one way from open to destroyed. Cancelling it signals
/// in-flight waits to stop but does not run any teardown; only
/// [`CleanupScope::unwind_all`] (or dropping an open scope) does.
pub struct CleanupScope {
    actions: Vec<CleanupAction>,
    state: ScopeState,
    token: CancellationToken,
}

impl fmt::Debug for CleanupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupScope")
            .field("actions", &self.labels())
            .field("state", &self.state)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Default for CleanupScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupScope {
    /// Creates an open scope with no actions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            state: ScopeState::Open,
            token: CancellationToken::new(),
        }
    }

    /// Appends a teardown action.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::NoCleanupContext`] when the scope has already
    /// been unwound.
    pub fn register<F, E>(&mut self, label: impl Into<String>, action: F) -> Result<(), CleanupError>
    where
        F: FnOnce() -> Result<(), E> + 'static,
        E: fmt::Display,
    {
        let label = label.into();
        if self.state == ScopeState::Destroyed {
            return Err(CleanupError::NoCleanupContext { label });
        }

        debug!(cleanup = %label, depth = self.actions.len() + 1, "registered cleanup");
        self.actions.push(CleanupAction {
            label,
            run: Box::new(move || action().map_err(|err| err.to_string())),
        });
        Ok(())
    }

    /// Cancels outstanding waits, then runs every registered action in
    /// reverse order.
    ///
    /// Failures are logged and collected; they never stop the remaining
    /// actions. Calling this again is a no-op.
    pub fn unwind_all(&mut self) -> UnwindReport {
        self.token.cancel();
        let mut report = UnwindReport::default();
        if self.state == ScopeState::Destroyed {
            return report;
        }
        self.state = ScopeState::Destroyed;

        let actions = std::mem::take(&mut self.actions);
        if !actions.is_empty() {
            info!(actions = actions.len(), "unwinding cleanup scope");
        }
        for CleanupAction { label, run } in actions.into_iter().rev() {
            debug!(cleanup = %label, "running cleanup");
            if let Err(message) = run() {
                error!(cleanup = %label, error = %message, "cleanup failed");
                report.failed.push(CleanupFailure {
                    label: label.clone(),
                    message,
                });
            }
            report.ran.push(label);
        }
        report
    }

    /// Returns a token that fires when this scope is cancelled or unwound.
    ///
    /// Child tokens may be cancelled independently without affecting the
    /// scope.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signals abandonment of in-flight waits without running any cleanup.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the scope has been cancelled or unwound.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` while actions can still be registered.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ScopeState::Open
    }

    /// Returns the number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` when no action is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the labels of pending actions in registration order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|action| action.label.as_str()).collect()
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        if self.is_open() {
            self.unwind_all();
        }
    }
}
