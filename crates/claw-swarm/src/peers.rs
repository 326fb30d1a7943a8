//! Registered gossip peers.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::node::NodeId;

/// A remote node and the endpoint its coordinator listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    /// Remote node identifier.
    pub node_id: NodeId,
    /// WebSocket endpoint, e.g. `ws://10.0.0.7:7946`.
    pub uri: String,
}

/// Peer table. Peers are only added explicitly and never expire.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<BTreeMap<NodeId, String>>,
}

impl PeerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `false` if the id was already known, in which
    /// case the existing endpoint is kept.
    pub fn register(&self, node_id: NodeId, uri: impl Into<String>) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&node_id) {
            debug!(node_id = %node_id, "peer already registered");
            return false;
        }
        let uri = uri.into();
        info!(node_id = %node_id, uri = %uri, "peer registered");
        peers.insert(node_id, uri);
        true
    }

    /// All peers, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<PeerLink> {
        self.peers
            .read()
            .iter()
            .map(|(node_id, uri)| PeerLink {
                node_id: node_id.clone(),
                uri: uri.clone(),
            })
            .collect()
    }

    /// Number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
