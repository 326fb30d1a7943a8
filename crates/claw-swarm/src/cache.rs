//! Last-known telemetry of every known node, local or remote.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::node::{NodeId, TelemetrySnapshot};

/// Where a cached snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Polled from a local device.
    Local,
    /// Received from a peer.
    Remote,
}

/// A cached snapshot and its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    /// The snapshot.
    pub snapshot: TelemetrySnapshot,
    /// Local poll or gossip.
    pub origin: Origin,
    /// When the snapshot was merged.
    pub received_at: DateTime<Utc>,
}

/// Concurrent map of the most recent snapshot per node.
///
/// Writes are last-write-wins by arrival; [`StateCache::merge`] is the only
/// mutation.
#[derive(Debug, Default)]
pub struct StateCache {
    states: RwLock<HashMap<NodeId, CachedState>>,
}

impl StateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `snapshot` as the latest state of `node_id`.
    pub fn merge(&self, node_id: NodeId, snapshot: TelemetrySnapshot, origin: Origin) {
        self.states.write().insert(
            node_id,
            CachedState {
                snapshot,
                origin,
                received_at: Utc::now(),
            },
        );
    }

    /// Cached state of one node.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<CachedState> {
        self.states.read().get(node_id).copied()
    }

    /// Number of cached nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// All entries, sorted by node id.
    #[must_use]
    pub fn entries(&self) -> Vec<(NodeId, CachedState)> {
        let mut all: Vec<_> = self
            .states
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Mean compute utilization across cached snapshots, 0 when empty.
    #[must_use]
    pub fn swarm_load(&self) -> f64 {
        let states = self.states.read();
        if states.is_empty() {
            return 0.0;
        }
        let total: f64 = states
            .values()
            .map(|s| s.snapshot.compute_utilization)
            .sum();
        total / states.len() as f64
    }

    /// Spread between the busiest and idlest cached node, 0 when empty.
    #[must_use]
    pub fn load_skew(&self) -> f64 {
        let states = self.states.read();
        let mut loads = states.values().map(|s| s.snapshot.compute_utilization);
        let Some(first) = loads.next() else {
            return 0.0;
        };
        let (min, max) = loads.fold((first, first), |(lo, hi), l| (lo.min(l), hi.max(l)));
        max - min
    }
}
