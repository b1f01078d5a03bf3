//! Wire types for the reservation registry.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::RegistryError;

/// Capacity figures advertised by a node.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeCapacity {
    /// Compute units.
    #[serde(default)]
    pub cru: u64,
    /// Memory units (GiB).
    #[serde(default)]
    pub mru: u64,
    /// HDD storage units (GiB).
    #[serde(default)]
    pub hru: u64,
    /// SSD storage units (GiB).
    #[serde(default)]
    pub sru: u64,
}

/// Capacity dimension used by [`super::NodeFilter::MinCapacity`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapacityKind {
    /// Compute units.
    Cru,
    /// Memory units.
    Mru,
    /// HDD storage units.
    Hru,
    /// SSD storage units.
    Sru,
}

impl NodeCapacity {
    /// Returns the figure for the requested dimension.
    #[must_use]
    pub const fn get(&self, kind: CapacityKind) -> u64 {
        match kind {
            CapacityKind::Cru => self.cru,
            CapacityKind::Mru => self.mru,
            CapacityKind::Hru => self.hru,
            CapacityKind::Sru => self.sru,
        }
    }
}

/// Marker for a node's public interface configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublicConfig {}

/// Read-only snapshot of a node as reported by the registry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Node {
    /// Registry identifier of the node.
    #[serde(rename = "node_id")]
    pub id: String,
    /// Unix timestamp (seconds) of the node's last heartbeat.
    #[serde(rename = "updated", default)]
    pub last_heartbeat: i64,
    /// Advertised capacity.
    #[serde(rename = "total_resources", default)]
    pub capacity: NodeCapacity,
    /// Present when the node exposes a public interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_config: Option<PublicConfig>,
}

impl Node {
    /// Returns `true` when the node advertises public connectivity.
    #[must_use]
    pub const fn has_public_connectivity(&self) -> bool {
        self.public_config.is_some()
    }
}

/// Lifecycle state of a reservation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    /// Accepted but not yet picked up.
    Pending,
    /// Being deployed by the node.
    Deploy,
    /// Deployed successfully.
    Ok,
    /// Deployment failed.
    Error,
    /// Any state this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ReservationState {
    /// Returns `true` for states that will not change further.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }

    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploy => "deploy",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of resource a reservation describes; selects the payload shape.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationKind {
    /// Private network.
    Network,
    /// Storage shard (0-db namespace).
    Zdb,
    /// Compute workload.
    Container,
    /// Block volume.
    Volume,
    /// Kubernetes VM.
    Kubernetes,
    /// Any kind this client does not know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Zdb => "zdb",
            Self::Container => "container",
            Self::Volume => "volume",
            Self::Kubernetes => "kubernetes",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Status of a reservation as reported by the registry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReservationResult {
    /// Registry identifier of the reservation.
    pub id: String,
    /// Resource kind; tags the shape of [`ReservationResult::data`].
    #[serde(rename = "type")]
    pub kind: ReservationKind,
    /// Current lifecycle state.
    pub state: ReservationState,
    /// Error message reported by the node, empty unless `state` is `error`.
    #[serde(rename = "error", default)]
    pub error_message: String,
    /// Kind-specific payload, decoded on demand via
    /// [`ReservationResult::payload`].
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed view of a reservation payload for one [`ReservationKind`].
pub trait ReservationPayload: DeserializeOwned {
    /// Kind whose payload this type decodes.
    const KIND: ReservationKind;
}

impl ReservationResult {
    /// Decodes the payload into the shape the caller expects.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PayloadMismatch`] when the reservation kind
    /// does not match `T::KIND`, or [`RegistryError::PayloadDecode`] when the
    /// payload does not deserialize into `T`.
    pub fn payload<T: ReservationPayload>(&self) -> Result<T, RegistryError> {
        if self.kind != T::KIND {
            return Err(RegistryError::PayloadMismatch {
                id: self.id.clone(),
                expected: T::KIND,
                actual: self.kind,
            });
        }

        T::deserialize(&self.data).map_err(|err| RegistryError::PayloadDecode {
            id: self.id.clone(),
            message: err.to_string(),
        })
    }
}

/// Payload of a provisioned storage shard.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StoragePayload {
    /// Namespace allocated on the shard.
    #[serde(rename = "Namespace")]
    pub namespace: String,
    /// Address the shard listens on.
    #[serde(rename = "IP")]
    pub ip: String,
    /// Port the shard listens on.
    #[serde(rename = "Port")]
    pub port: u16,
}

impl ReservationPayload for StoragePayload {
    const KIND: ReservationKind = ReservationKind::Zdb;
}

/// Envelope returned by `GET /reservations/{id}`.
#[derive(Debug, Deserialize)]
pub(super) struct ReservationEnvelope {
    pub(super) result: ReservationResult,
}
