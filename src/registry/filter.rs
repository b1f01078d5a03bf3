//! In-memory node selection: conjunctive filters and placement shuffling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::seq::SliceRandom;

use super::types::{CapacityKind, Node};

/// Predicate applied to registry nodes. A node is eligible only when every
/// supplied filter matches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeFilter {
    /// Node reported a heartbeat within `window` of `now` (Unix seconds).
    RecentlyActive {
        /// Maximum heartbeat age.
        window: Duration,
        /// Reference time in Unix seconds.
        now: i64,
    },
    /// Node exposes a public interface.
    PublicConnectivity,
    /// Node advertises strictly more than `threshold` units of `kind`.
    MinCapacity {
        /// Capacity dimension to inspect.
        kind: CapacityKind,
        /// Exclusive lower bound.
        threshold: u64,
    },
}

impl NodeFilter {
    /// Matches nodes whose last heartbeat is younger than `window`,
    /// measured against the current wall clock.
    #[must_use]
    pub fn recently_active(window: Duration) -> Self {
        Self::RecentlyActive {
            window,
            now: unix_now(),
        }
    }

    /// Matches nodes that advertise a public interface.
    #[must_use]
    pub const fn public_connectivity() -> Self {
        Self::PublicConnectivity
    }

    /// Matches nodes with more than `threshold` units of `kind`.
    #[must_use]
    pub const fn min_capacity(kind: CapacityKind, threshold: u64) -> Self {
        Self::MinCapacity { kind, threshold }
    }

    /// Evaluates the filter against `node`.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        match *self {
            Self::RecentlyActive { window, now } => {
                let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
                now.saturating_sub(node.last_heartbeat) < window_secs
            }
            Self::PublicConnectivity => node.has_public_connectivity(),
            Self::MinCapacity { kind, threshold } => node.capacity.get(kind) > threshold,
        }
    }
}

/// Keeps the nodes that satisfy every filter, preserving order. An empty
/// filter list keeps everything.
#[must_use]
pub fn apply_filters(nodes: Vec<Node>, filters: &[NodeFilter]) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|node| filters.iter().all(|filter| filter.matches(node)))
        .collect()
}

/// Randomises placement across equally eligible nodes (Fisher–Yates).
pub fn shuffle_nodes<R: Rng + ?Sized>(nodes: &mut [Node], rng: &mut R) {
    nodes.shuffle(rng);
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}
