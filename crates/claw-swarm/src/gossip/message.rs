//! Gossip wire message.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::node::{NodeId, TelemetrySnapshot};

/// A node's snapshot as exchanged between coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipEnvelope {
    /// Node the snapshot belongs to.
    pub node_id: NodeId,
    /// The node's latest telemetry.
    pub snapshot: TelemetrySnapshot,
}

impl GossipEnvelope {
    /// Create an envelope.
    #[must_use]
    pub const fn new(node_id: NodeId, snapshot: TelemetrySnapshot) -> Self {
        Self { node_id, snapshot }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
