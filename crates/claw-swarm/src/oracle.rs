//! Per-node adaptive batch sizing.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::OracleConfig;
use crate::error::{Result, SwarmError};
use crate::node::{ComputeNode, TelemetrySnapshot};

/// A batch-size decision and the poll it was based on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted batch size, at least 1.
    pub batch_size: u32,
    /// Snapshot from the poll that fed the decision.
    pub snapshot: TelemetrySnapshot,
}

/// Ring plot of the decision history.
///
/// `vertices` holds flattened `x, y` pairs and `colors` flattened RGBA
/// quadruples, one per decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRing {
    /// Flattened `[x0, y0, x1, y1, ...]`.
    pub vertices: Vec<f32>,
    /// Flattened `[r0, g0, b0, a0, ...]`.
    pub colors: Vec<f32>,
}

impl HistoryRing {
    /// Build the ring for a sequence of decisions.
    #[must_use]
    pub fn from_history(history: &[u32]) -> Self {
        let n = history.len();
        if n == 0 {
            return Self::default();
        }

        let max = f64::from(history.iter().copied().max().unwrap_or(0));
        let step = if n > 1 { TAU / (n - 1) as f64 } else { 0.0 };

        let mut vertices = Vec::with_capacity(n * 2);
        let mut colors = Vec::with_capacity(n * 4);
        for (i, &h) in history.iter().enumerate() {
            let theta = step * i as f64;
            let r = (f64::from(h) / (max + 1e-10)).sin() * 0.5 + 0.5;
            vertices.push((r * theta.cos()) as f32);
            vertices.push((r * theta.sin()) as f32);
            colors.extend_from_slice(&[0.0, 1.0, 0.0, 1.0]);
        }

        Self { vertices, colors }
    }

    /// Number of plotted points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vertices.len() / 2
    }

    /// Whether the ring has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// Batch size for one decision.
///
/// `free = total * (1 - memory_utilization)`,
/// `base = max(1, floor(free / (model * headroom)))`,
/// `result = max(1, floor(base * (1 - priority * load * guardian)))`.
#[must_use]
pub fn compute_batch_size(
    total_memory_mb: u64,
    snapshot: &TelemetrySnapshot,
    model_size_mb: u64,
    swarm_load: f64,
    headroom_factor: f64,
) -> u32 {
    let free = total_memory_mb as f64 * (1.0 - snapshot.memory_utilization);
    let base = (free / (model_size_mb as f64 * headroom_factor)).floor().max(1.0);
    let adjust = 1.0 - snapshot.priority_score * swarm_load * snapshot.guardian_score;
    (base * adjust).floor().max(1.0) as u32
}

/// Adaptive batch-size predictor owned by one node.
///
/// Predictions for the same node are serialized; the lock is held across the
/// poll so two decisions never interleave.
#[derive(Debug)]
pub struct AllocationOracle {
    node: Arc<ComputeNode>,
    history: Mutex<VecDeque<u32>>,
    capacity: usize,
    headroom_factor: f64,
}

impl AllocationOracle {
    /// Create an oracle for `node`.
    #[must_use]
    pub fn new(node: Arc<ComputeNode>, config: &OracleConfig) -> Self {
        Self {
            node,
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            capacity: config.history_capacity.max(1),
            headroom_factor: config.headroom_factor,
        }
    }

    /// The node this oracle decides for.
    #[must_use]
    pub const fn node(&self) -> &Arc<ComputeNode> {
        &self.node
    }

    /// Poll the node and predict a safe batch size.
    ///
    /// # Errors
    ///
    /// [`SwarmError::InvalidArgument`] for a zero model size; poll errors
    /// propagate unchanged and record nothing.
    pub async fn predict_batch_size(
        &self,
        model_size_mb: u64,
        swarm_load: f64,
        cancel: &CancellationToken,
    ) -> Result<Prediction> {
        if model_size_mb == 0 {
            return Err(SwarmError::InvalidArgument(
                "model_size_mb must be positive".to_string(),
            ));
        }
        let swarm_load = if swarm_load.is_nan() {
            0.0
        } else {
            swarm_load.clamp(0.0, 1.0)
        };

        let mut history = self.history.lock().await;
        let snapshot = self.node.poll(cancel).await?;

        let batch_size = compute_batch_size(
            self.node.total_memory_mb(),
            &snapshot,
            model_size_mb,
            swarm_load,
            self.headroom_factor,
        );

        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(batch_size);

        debug!(
            node_id = %self.node.id(),
            model_size_mb,
            swarm_load,
            batch_size,
            "batch size predicted"
        );

        Ok(Prediction {
            batch_size,
            snapshot,
        })
    }

    /// Decisions in order, oldest first.
    pub async fn history(&self) -> Vec<u32> {
        self.history.lock().await.iter().copied().collect()
    }

    /// Ring plot of the current history.
    pub async fn visualize(&self) -> HistoryRing {
        let history = self.history().await;
        HistoryRing::from_history(&history)
    }
}
