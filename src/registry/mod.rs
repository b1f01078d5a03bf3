//! Read-only client for the reservation registry.
//!
//! The registry exposes the set of nodes available for placement and tracks
//! each reservation as it converges from `pending`/`deploy` to a terminal
//! `ok`/`error` state. Provisioning itself is phase one and lives in
//! [`crate::lifecycle`]; this module owns phase two, waiting for convergence.
//!
//! Polling is deliberately sequential: one outstanding wait at a time, in the
//! order the reservations were issued.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lifecycle::ReservationId;

mod filter;
mod http;
mod types;

pub use filter::{NodeFilter, apply_filters, shuffle_nodes};
pub use http::HttpRegistry;
pub use types::{
    CapacityKind, Node, NodeCapacity, PublicConfig, ReservationKind, ReservationPayload,
    ReservationResult, ReservationState, StoragePayload,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_POLLS: u32 = 20;

/// Errors raised by the registry client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when the registry cannot be reached or answers with something
    /// that is not the expected document.
    #[error("registry unavailable at {endpoint}: {message}")]
    Unavailable {
        /// Endpoint that was queried.
        endpoint: String,
        /// Transport or decoding failure.
        message: String,
    },
    /// Raised when the configured registry URL cannot be used.
    #[error("invalid registry url {url}: {message}")]
    InvalidBaseUrl {
        /// URL supplied by the caller.
        url: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the HTTP client cannot be initialised.
    #[error("registry transport could not be initialised: {message}")]
    Transport {
        /// Builder error message.
        message: String,
    },
    /// Raised when a reservation does not reach a terminal state within the
    /// polling budget.
    #[error("reservation {id} did not reach a terminal state after {polls} polls")]
    ProvisionTimeout {
        /// Reservation that was being awaited.
        id: ReservationId,
        /// Number of polls performed.
        polls: u32,
    },
    /// Raised when waiting is abandoned because the owning scope was
    /// cancelled.
    #[error("wait for reservation {id} was cancelled")]
    Cancelled {
        /// Reservation that was being awaited.
        id: ReservationId,
    },
    /// Raised when a payload is requested in a shape that does not match the
    /// reservation kind.
    #[error("reservation {id} is a {actual} reservation, not {expected}")]
    PayloadMismatch {
        /// Registry identifier of the reservation.
        id: String,
        /// Kind the caller asked for.
        expected: ReservationKind,
        /// Kind reported by the registry.
        actual: ReservationKind,
    },
    /// Raised when a payload of the right kind cannot be decoded.
    #[error("reservation {id} payload could not be decoded: {message}")]
    PayloadDecode {
        /// Registry identifier of the reservation.
        id: String,
        /// Decoder error message.
        message: String,
    },
    /// Raised when automatic node discovery finds no candidate.
    #[error("no recently active nodes with public connectivity found")]
    NoEligibleNodes,
}

/// Future returned by registry transport operations.
pub type RegistryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

/// Transport used by [`RegistryClient`] to reach the registry.
pub trait RegistryApi {
    /// Fetches the full, unfiltered node list.
    fn fetch_nodes(&self) -> RegistryFuture<'_, Vec<Node>>;

    /// Fetches the current status of a single reservation.
    fn fetch_reservation<'a>(
        &'a self,
        id: &'a ReservationId,
    ) -> RegistryFuture<'a, ReservationResult>;
}

/// Polling budget for [`RegistryClient::await_all`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Pause between two polls of the same reservation.
    pub interval: Duration,
    /// Maximum number of polls per reservation.
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

/// Queries nodes and waits for reservations to converge.
///
/// The client holds no mutable state and can be reused across steps.
#[derive(Clone, Debug)]
pub struct RegistryClient<A> {
    api: A,
}

impl RegistryClient<HttpRegistry> {
    /// Builds a client talking HTTP to the registry at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBaseUrl`] when the URL cannot be
    /// parsed.
    pub fn http(base_url: &str) -> Result<Self, RegistryError> {
        HttpRegistry::new(base_url).map(Self::new)
    }
}

impl<A: RegistryApi> RegistryClient<A> {
    /// Wraps the given transport.
    #[must_use]
    pub const fn new(api: A) -> Self {
        Self { api }
    }

    /// Lists nodes that satisfy every filter. With no filters the full list
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] on transport or decoding
    /// failure.
    pub async fn list_nodes(&self, filters: &[NodeFilter]) -> Result<Vec<Node>, RegistryError> {
        let nodes = self.api.fetch_nodes().await?;
        Ok(apply_filters(nodes, filters))
    }

    /// Fetches the current status of one reservation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] on transport or decoding
    /// failure.
    pub async fn fetch_result(&self, id: &ReservationId) -> Result<ReservationResult, RegistryError> {
        self.api.fetch_reservation(id).await
    }

    /// Waits for each reservation in turn to reach `ok` or `error`.
    ///
    /// Reservations are awaited sequentially in the given order. The first
    /// reservation that exhausts its polling budget fails the whole call; the
    /// remaining ones are not polled.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ProvisionTimeout`] when a reservation stays
    /// non-terminal for `policy.max_polls` polls,
    /// [`RegistryError::Cancelled`] when `cancel` fires, and propagates
    /// transport failures from [`RegistryClient::fetch_result`].
    pub async fn await_all(
        &self,
        ids: &[ReservationId],
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReservationResult>, RegistryError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.await_one(id, policy, cancel).await?);
        }
        Ok(results)
    }

    async fn await_one(
        &self,
        id: &ReservationId,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<ReservationResult, RegistryError> {
        for poll in 1..=policy.max_polls {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled { id: id.clone() });
            }

            debug!(reservation = %id, poll, "waiting for reservation");
            let result = self.fetch_result(id).await?;
            debug!(reservation = %id, state = %result.state, "reservation status");
            if result.state.is_terminal() {
                return Ok(result);
            }

            if poll < policy.max_polls {
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(RegistryError::Cancelled { id: id.clone() });
                    }
                    () = sleep(policy.interval) => {}
                }
            }
        }

        Err(RegistryError::ProvisionTimeout {
            id: id.clone(),
            polls: policy.max_polls,
        })
    }
}

/// Picks a random recently active node with public connectivity.
///
/// # Errors
///
/// Returns [`RegistryError::NoEligibleNodes`] when no node qualifies and
/// propagates transport failures.
pub async fn select_node<A, R>(
    client: &RegistryClient<A>,
    heartbeat_window: Duration,
    rng: &mut R,
) -> Result<String, RegistryError>
where
    A: RegistryApi,
    R: Rng + ?Sized,
{
    let mut nodes = client
        .list_nodes(&[
            NodeFilter::recently_active(heartbeat_window),
            NodeFilter::public_connectivity(),
        ])
        .await?;
    debug!(nodes = nodes.len(), "found public nodes");

    shuffle_nodes(&mut nodes, rng);
    nodes
        .into_iter()
        .next()
        .map(|node| node.id)
        .ok_or(RegistryError::NoEligibleNodes)
}

#[cfg(test)]
mod tests;
