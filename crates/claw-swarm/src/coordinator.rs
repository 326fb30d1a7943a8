//! Fleet coordinator: discovery, orchestration rounds, gossip and rebalancing.
//!
//! The [`SwarmCoordinator`] owns the local node arena, the peer table, the
//! last-known state cache and the alert aggregator. It is long-lived; all
//! state survives across rounds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertAggregator;
use crate::cache::{CachedState, Origin, StateCache};
use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::gossip::{GossipChannel, GossipEnvelope, GossipHandler, GossipReport, GossipTransport};
use crate::node::{ComputeNode, NodeId, NodeStatus, TelemetrySnapshot, Tier};
use crate::oracle::{AllocationOracle, HistoryRing};
use crate::peers::{PeerLink, PeerTable};
use crate::resilience::{ResiliencePolicy, retry_with_backoff};
use crate::telemetry::TelemetrySource;

/// Skew differences smaller than this are treated as equal to the threshold.
/// Utilizations arrive as whole percentages, so float noise must not trip a
/// rebalance at exactly the threshold.
const SKEW_TOLERANCE: f64 = 1e-9;

/// Outcome for one node in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// The node received an allocation.
    Allocated {
        /// Final batch size, after protective halving.
        batch_size: u32,
        /// Opaque task token (32 hex chars).
        task_token: String,
        /// Snapshot the allocation was based on.
        snapshot: TelemetrySnapshot,
        /// Last successful query is older than the stale threshold.
        stale: bool,
        /// The batch size was halved because of high priority.
        throttled: bool,
    },
    /// Polling or prediction failed for the node.
    Failed {
        /// Error text.
        error: String,
        /// Last successful query is older than the stale threshold.
        stale: bool,
    },
}

impl RoundOutcome {
    /// Whether the node is flagged stale.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        match self {
            Self::Allocated { stale, .. } | Self::Failed { stale, .. } => *stale,
        }
    }

    /// Final batch size, if allocated.
    #[must_use]
    pub const fn batch_size(&self) -> Option<u32> {
        match self {
            Self::Allocated { batch_size, .. } => Some(*batch_size),
            Self::Failed { .. } => None,
        }
    }
}

/// Per-node entry of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRoundResult {
    /// Node identifier.
    pub node_id: NodeId,
    /// Device name.
    pub name: String,
    /// Capability band.
    pub tier: Tier,
    /// What happened.
    #[serde(flatten)]
    pub outcome: RoundOutcome,
}

/// Aggregate visualization payload of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundVisual {
    /// History ring of the first registered node's oracle.
    pub history: HistoryRing,
    /// Fleet alert level.
    pub alert_level: f64,
}

/// Result of one orchestration round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    /// Workload label.
    pub workload: String,
    /// Mean compute utilization of cached snapshots when the round started.
    pub swarm_load: f64,
    /// At least one node was throttled.
    pub protective_response: bool,
    /// Per-node results in registry order.
    pub nodes: Vec<NodeRoundResult>,
    /// Visualization payload.
    pub visual: RoundVisual,
}

/// A hot node the rebalancer re-planned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAdjustment {
    /// Node identifier.
    pub node_id: NodeId,
    /// Freshly polled compute utilization.
    pub utilization: f64,
    /// Batch size for the configured model size.
    pub batch_size: u32,
    /// Batch size for half the model size, after the load was recomputed.
    pub reduced_batch_size: u32,
}

/// Result of a rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Load skew observed before rebalancing.
    pub skew: f64,
    /// Whether the skew exceeded the threshold.
    pub triggered: bool,
    /// Re-planned nodes.
    pub adjustments: Vec<RebalanceAdjustment>,
}

/// A cache entry as reported in [`FleetStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNode {
    /// Node identifier.
    pub node_id: NodeId,
    /// Cached state.
    #[serde(flatten)]
    pub state: CachedState,
}

/// Fleet-wide status for front ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Discovery has completed.
    pub active: bool,
    /// Local nodes in registry order.
    pub nodes: Vec<NodeStatus>,
    /// Registered peers.
    pub peers: Vec<PeerLink>,
    /// Last-known state of every known node.
    pub cached: Vec<CachedNode>,
    /// Mean compute utilization of cached snapshots.
    pub swarm_load: f64,
    /// Fleet alert level.
    pub alert_level: f64,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Arc<ComputeNode>,
    oracle: Arc<AllocationOracle>,
}

/// Coordinates a fleet of local accelerators and their peers.
pub struct SwarmCoordinator {
    config: SwarmConfig,
    source: Arc<dyn TelemetrySource>,
    nodes: RwLock<Vec<NodeEntry>>,
    discovery: Mutex<()>,
    active: AtomicBool,
    peers: PeerTable,
    cache: StateCache,
    alerts: AlertAggregator,
    gossip: GossipChannel,
    shutdown: CancellationToken,
    status_tx: watch::Sender<FleetStatus>,
}

impl std::fmt::Debug for SwarmCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmCoordinator")
            .field("active", &self.is_active())
            .field("nodes", &self.node_count())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl SwarmCoordinator {
    /// Create an inactive coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::Config`] if `config` is invalid.
    pub fn new(
        config: SwarmConfig,
        source: Arc<dyn TelemetrySource>,
        transport: Arc<dyn GossipTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let gossip = GossipChannel::new(transport, config.gossip.retry.policy());
        let (status_tx, _) = watch::channel(FleetStatus::default());

        Ok(Self {
            config,
            source,
            nodes: RwLock::new(Vec::new()),
            discovery: Mutex::new(()),
            active: AtomicBool::new(false),
            peers: PeerTable::new(),
            cache: StateCache::new(),
            alerts: AlertAggregator::new(),
            gossip,
            shutdown: CancellationToken::new(),
            status_tx,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Whether discovery has completed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of local nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Local nodes in registry order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<ComputeNode>> {
        self.nodes.read().iter().map(|e| Arc::clone(&e.node)).collect()
    }

    /// Look up a local node.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<Arc<ComputeNode>> {
        self.entry(id).map(|e| e.node)
    }

    /// Look up a local node's oracle.
    #[must_use]
    pub fn oracle(&self, id: &NodeId) -> Option<Arc<AllocationOracle>> {
        self.entry(id).map(|e| e.oracle)
    }

    /// The last-known state cache.
    #[must_use]
    pub const fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Token cancelling every in-flight operation of this coordinator.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight operations; they return [`SwarmError::Cancelled`].
    pub fn shutdown(&self) {
        info!("coordinator shutting down");
        self.shutdown.cancel();
    }

    fn entry(&self, id: &NodeId) -> Option<NodeEntry> {
        self.nodes.read().iter().find(|e| e.node.id() == id).cloned()
    }

    fn entries(&self) -> Vec<NodeEntry> {
        self.nodes.read().clone()
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Enumerate local devices and register one node per device.
    ///
    /// No-op on an active coordinator. Returns the number of local nodes.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::Discovery`] once enumeration retries are spent,
    /// or [`SwarmError::Cancelled`].
    pub async fn discover(&self) -> Result<usize> {
        let cancel = self.shutdown.clone();
        self.discover_with_cancel(&cancel).await
    }

    async fn discover_with_cancel(&self, cancel: &CancellationToken) -> Result<usize> {
        let _guard = self.discovery.lock().await;
        if self.is_active() {
            return Ok(self.node_count());
        }

        let policy = self.config.discovery.policy();
        let mut attempts = 0;
        let enumerated = retry_with_backoff(&policy, cancel, "discovery", || {
            attempts += 1;
            self.source.enumerate()
        })
        .await;
        let devices = enumerated.map_err(|e| match e {
            SwarmError::Cancelled => e,
            other => SwarmError::Discovery {
                attempts,
                reason: other.to_string(),
            },
        })?;

        let mut entries = Vec::with_capacity(devices.len());
        for device in &devices {
            let node = Arc::new(ComputeNode::new(
                NodeId::generate(),
                device,
                Arc::clone(&self.source),
                ResiliencePolicy::new(
                    self.config.resilience.retry.policy(),
                    self.config.resilience.breaker(),
                ),
            ));
            info!(
                node_id = %node.id(),
                device_index = device.index,
                name = %device.name,
                tier = %node.tier(),
                "node discovered"
            );

            match node.poll(cancel).await {
                Ok(snapshot) => self.cache.merge(node.id().clone(), snapshot, Origin::Local),
                Err(SwarmError::Cancelled) => return Err(SwarmError::Cancelled),
                Err(e) => warn!(node_id = %node.id(), error = %e, "seed poll failed"),
            }

            let oracle = Arc::new(AllocationOracle::new(Arc::clone(&node), &self.config.oracle));
            entries.push(NodeEntry { node, oracle });
        }

        let count = entries.len();
        *self.nodes.write() = entries;
        self.active.store(true, Ordering::SeqCst);
        info!(nodes = count, "discovery complete");
        self.publish_status();
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    /// Run one orchestration round over every local node.
    ///
    /// # Errors
    ///
    /// Fails only if discovery never succeeds, the model size is zero, or
    /// the round is cancelled. Per-node failures are recorded in the result.
    pub async fn run_round(&self, workload: &str, model_size_mb: u64) -> Result<RoundResult> {
        let cancel = self.shutdown.clone();
        self.run_round_with_cancel(workload, model_size_mb, &cancel)
            .await
    }

    /// [`run_round`](Self::run_round) with a caller-provided token.
    pub async fn run_round_with_cancel(
        &self,
        workload: &str,
        model_size_mb: u64,
        cancel: &CancellationToken,
    ) -> Result<RoundResult> {
        if model_size_mb == 0 {
            return Err(SwarmError::InvalidArgument(
                "model_size_mb must be positive".to_string(),
            ));
        }
        if !self.is_active() {
            self.discover_with_cancel(cancel).await?;
        }

        let swarm_load = self.cache.swarm_load();
        let entries = self.entries();
        let mut nodes = Vec::with_capacity(entries.len());
        let mut protective_response = false;

        for entry in &entries {
            let outcome = self
                .round_for_node(entry, model_size_mb, swarm_load, cancel)
                .await?;
            if matches!(outcome, RoundOutcome::Allocated { throttled: true, .. }) {
                protective_response = true;
            }
            nodes.push(NodeRoundResult {
                node_id: entry.node.id().clone(),
                name: entry.node.name().to_string(),
                tier: entry.node.tier(),
                outcome,
            });
        }

        let history = match entries.first() {
            Some(entry) => entry.oracle.visualize().await,
            None => HistoryRing::default(),
        };

        let result = RoundResult {
            workload: workload.to_string(),
            swarm_load,
            protective_response,
            nodes,
            visual: RoundVisual {
                history,
                alert_level: self.alerts.level(),
            },
        };

        info!(
            workload,
            nodes = result.nodes.len(),
            swarm_load,
            protective_response,
            "round complete"
        );
        self.publish_status();
        Ok(result)
    }

    async fn round_for_node(
        &self,
        entry: &NodeEntry,
        model_size_mb: u64,
        swarm_load: f64,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome> {
        let node = &entry.node;
        let stale_after = self.config.round.stale_after();

        let polled = node.poll(cancel).await;
        let stale = node.is_stale(stale_after);
        if stale {
            warn!(node_id = %node.id(), "node is stale");
        }

        match polled {
            Ok(snapshot) => self.cache.merge(node.id().clone(), snapshot, Origin::Local),
            Err(SwarmError::Cancelled) => return Err(SwarmError::Cancelled),
            Err(e) => {
                warn!(node_id = %node.id(), error = %e, "poll failed during round");
                return Ok(RoundOutcome::Failed {
                    error: e.to_string(),
                    stale,
                });
            }
        }

        let prediction = match entry
            .oracle
            .predict_batch_size(model_size_mb, swarm_load, cancel)
            .await
        {
            Ok(prediction) => prediction,
            Err(SwarmError::Cancelled) => return Err(SwarmError::Cancelled),
            Err(e) => {
                warn!(node_id = %node.id(), error = %e, "prediction failed during round");
                return Ok(RoundOutcome::Failed {
                    error: e.to_string(),
                    stale,
                });
            }
        };
        let snapshot = prediction.snapshot;
        self.cache.merge(node.id().clone(), snapshot, Origin::Local);

        let throttled = snapshot.priority_score > self.config.round.protective_priority_threshold;
        let batch_size = if throttled {
            (prediction.batch_size / 2).max(1)
        } else {
            prediction.batch_size
        };
        if throttled {
            info!(
                node_id = %node.id(),
                priority = snapshot.priority_score,
                predicted = prediction.batch_size,
                batch_size,
                "protective response: batch halved"
            );
        }

        let task_token = task_token();
        debug!(node_id = %node.id(), batch_size, task_token = %task_token, "allocation made");

        self.gossip_with_cancel(node.id().clone(), snapshot, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(SwarmError::Cancelled);
        }

        Ok(RoundOutcome::Allocated {
            batch_size,
            task_token,
            snapshot,
            stale,
            throttled,
        })
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    /// Push a node's snapshot to every registered peer except the node itself.
    ///
    /// Each reply overwrites the cache entry of the node it names, the same
    /// key an inbound push from that node uses. Failures are logged and
    /// reported, never returned as errors.
    pub async fn gossip(&self, node_id: NodeId, snapshot: TelemetrySnapshot) -> GossipReport {
        let cancel = self.shutdown.clone();
        self.gossip_with_cancel(node_id, snapshot, &cancel).await
    }

    async fn gossip_with_cancel(
        &self,
        node_id: NodeId,
        snapshot: TelemetrySnapshot,
        cancel: &CancellationToken,
    ) -> GossipReport {
        let peers = self.peers.list();
        if peers.is_empty() {
            return GossipReport::default();
        }

        let envelope = GossipEnvelope::new(node_id, snapshot);
        let report = self.gossip.push(&peers, &envelope, cancel).await;

        for (peer_id, reply) in &report.delivered {
            if self.is_local(&reply.node_id) {
                debug!(
                    peer = %peer_id,
                    node_id = %reply.node_id,
                    "ignoring reply naming a local node"
                );
                continue;
            }
            self.cache
                .merge(reply.node_id.clone(), reply.snapshot, Origin::Remote);
        }
        if !report.delivered.is_empty() {
            self.publish_status();
        }
        report
    }

    fn is_local(&self, node_id: &NodeId) -> bool {
        self.nodes.read().iter().any(|e| e.node.id() == node_id)
    }

    /// The snapshot this coordinator answers gossip with: the first local
    /// node that has a cached state.
    #[must_use]
    pub fn primary_snapshot(&self) -> Option<GossipEnvelope> {
        self.nodes.read().iter().find_map(|e| {
            self.cache
                .get(e.node.id())
                .map(|state| GossipEnvelope::new(e.node.id().clone(), state.snapshot))
        })
    }

    // ------------------------------------------------------------------
    // Rebalance
    // ------------------------------------------------------------------

    /// Re-plan hot nodes when load skew across the cache exceeds the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::Cancelled`] if cancelled; per-node failures are
    /// logged and skipped.
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        let cancel = self.shutdown.clone();
        self.rebalance_with_cancel(&cancel).await
    }

    async fn rebalance_with_cancel(&self, cancel: &CancellationToken) -> Result<RebalanceReport> {
        let cfg = &self.config.rebalance;
        let skew = self.cache.load_skew();
        if skew - cfg.skew_threshold <= SKEW_TOLERANCE {
            debug!(skew, threshold = cfg.skew_threshold, "load balanced");
            return Ok(RebalanceReport {
                skew,
                triggered: false,
                adjustments: Vec::new(),
            });
        }

        info!(skew, threshold = cfg.skew_threshold, "load skew detected, rebalancing");
        let mut adjustments = Vec::new();

        for entry in self.entries() {
            match self.rebalance_node(&entry, cancel).await {
                Ok(Some(adjustment)) => adjustments.push(adjustment),
                Ok(None) => {}
                Err(SwarmError::Cancelled) => return Err(SwarmError::Cancelled),
                Err(e) => {
                    warn!(node_id = %entry.node.id(), error = %e, "rebalance skipped node");
                }
            }
        }

        self.publish_status();
        Ok(RebalanceReport {
            skew,
            triggered: true,
            adjustments,
        })
    }

    async fn rebalance_node(
        &self,
        entry: &NodeEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<RebalanceAdjustment>> {
        let cfg = &self.config.rebalance;
        let node = &entry.node;

        let fresh = node.poll(cancel).await?;
        self.cache.merge(node.id().clone(), fresh, Origin::Local);
        if fresh.compute_utilization <= cfg.hot_utilization {
            return Ok(None);
        }

        let first = entry
            .oracle
            .predict_batch_size(cfg.model_size_mb, self.cache.swarm_load(), cancel)
            .await?;
        self.cache.merge(node.id().clone(), first.snapshot, Origin::Local);

        let reduced_model = (cfg.model_size_mb / 2).max(1);
        let second = entry
            .oracle
            .predict_batch_size(reduced_model, self.cache.swarm_load(), cancel)
            .await?;
        self.cache.merge(node.id().clone(), second.snapshot, Origin::Local);

        info!(
            node_id = %node.id(),
            utilization = fresh.compute_utilization,
            batch_size = first.batch_size,
            reduced_batch_size = second.batch_size,
            "hot node re-planned"
        );

        Ok(Some(RebalanceAdjustment {
            node_id: node.id().clone(),
            utilization: fresh.compute_utilization,
            batch_size: first.batch_size,
            reduced_batch_size: second.batch_size,
        }))
    }

    // ------------------------------------------------------------------
    // Front end
    // ------------------------------------------------------------------

    /// Register a gossip peer. Returns `false` if the id was already known.
    pub fn register_peer(&self, uri: impl Into<String>, node_id: NodeId) -> bool {
        let added = self.peers.register(node_id, uri);
        if added {
            self.publish_status();
        }
        added
    }

    /// Registered peers.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerLink> {
        self.peers.list()
    }

    /// Escalate concern about `target`, returning its new severity.
    pub fn escalate(&self, target: &str, evidence: &str) -> f64 {
        let severity = self.alerts.escalate(target, evidence);
        self.publish_status();
        severity
    }

    /// Fleet alert level.
    #[must_use]
    pub fn alert_level(&self) -> f64 {
        self.alerts.level()
    }

    /// Current fleet status.
    #[must_use]
    pub fn status(&self) -> FleetStatus {
        FleetStatus {
            active: self.is_active(),
            nodes: self.nodes.read().iter().map(|e| e.node.status()).collect(),
            peers: self.peers.list(),
            cached: self
                .cache
                .entries()
                .into_iter()
                .map(|(node_id, state)| CachedNode { node_id, state })
                .collect(),
            swarm_load: self.cache.swarm_load(),
            alert_level: self.alerts.level(),
        }
    }

    /// Subscribe to status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FleetStatus> {
        self.status_tx.subscribe()
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }
}

impl GossipHandler for SwarmCoordinator {
    fn on_push(&self, envelope: GossipEnvelope) -> Option<GossipEnvelope> {
        if self.is_local(&envelope.node_id) {
            debug!(from = %envelope.node_id, "ignoring push naming a local node");
        } else {
            debug!(from = %envelope.node_id, "merging pushed snapshot");
            self.cache.merge(envelope.node_id, envelope.snapshot, Origin::Remote);
            self.publish_status();
        }
        self.primary_snapshot()
    }
}

/// 16 random bytes, hex encoded.
fn task_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
