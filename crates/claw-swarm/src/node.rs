//! Compute nodes: one accelerator's identity, capacity and health scores.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::resilience::{BreakerState, ResiliencePolicy};
use crate::telemetry::{DeviceDescriptor, RawTelemetry, TelemetrySource};

/// Memory of the largest consumer card, used to normalize priority.
pub const REFERENCE_MEMORY_MB: f64 = 24576.0;

/// Lowest priority a node can report.
pub const MIN_PRIORITY: f64 = 0.1;

/// Lowest trust a node can fall to.
pub const MIN_TRUST: f64 = 0.1;

const TRUST_REWARD: f64 = 0.01;
const TRUST_PENALTY: f64 = 0.1;

/// Opaque identifier of a local or remote node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Capability band, fixed at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Under 2 GB or compute capability under 3.0.
    Minimal,
    /// Under 4 GB.
    Entry,
    /// Under 8 GB.
    Mainstream,
    /// Under 16 GB.
    Performance,
    /// Under 24 GB.
    Enthusiast,
    /// 24 GB and above.
    Flagship,
}

impl Tier {
    /// Classify a device by memory and compute capability.
    #[must_use]
    pub fn classify(total_memory_mb: u64, compute_capability: f64) -> Self {
        if total_memory_mb < 2048 || compute_capability < 3.0 {
            Self::Minimal
        } else if total_memory_mb < 4096 {
            Self::Entry
        } else if total_memory_mb < 8192 {
            Self::Mainstream
        } else if total_memory_mb < 16384 {
            Self::Performance
        } else if total_memory_mb < 24576 {
            Self::Enthusiast
        } else {
            Self::Flagship
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minimal => "minimal",
            Self::Entry => "entry",
            Self::Mainstream => "mainstream",
            Self::Performance => "performance",
            Self::Enthusiast => "enthusiast",
            Self::Flagship => "flagship",
        };
        f.write_str(s)
    }
}

/// Guardian score for a compute capability: `max(0, 1 - cap/10)`, at most 1.
#[must_use]
pub fn guardian_score(compute_capability: f64) -> f64 {
    (1.0 - compute_capability / 10.0).clamp(0.0, 1.0)
}

/// Fairness-aware priority, never below [`MIN_PRIORITY`].
#[must_use]
pub fn priority_score(
    compute_capability: f64,
    total_memory_mb: u64,
    trust: f64,
    guardian: f64,
) -> f64 {
    let strength = (compute_capability / 10.0) * (total_memory_mb as f64 / REFERENCE_MEMORY_MB);
    ((1.0 - strength) * trust * guardian).max(MIN_PRIORITY)
}

/// Mutable health scores of a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeScores {
    /// Trust in [`MIN_TRUST`, 1].
    pub trust: f64,
    /// Guardian in [0, 1].
    pub guardian: f64,
    /// Monotonic time of the last successful query.
    pub last_seen: Instant,
    /// Wall-clock time of the last successful query.
    pub last_seen_at: DateTime<Utc>,
}

impl NodeScores {
    /// Fresh scores: full trust, guardian derived from capability.
    #[must_use]
    pub fn new(compute_capability: f64) -> Self {
        Self {
            trust: 1.0,
            guardian: guardian_score(compute_capability),
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
        }
    }

    /// Apply a successful query.
    pub fn record_success(&mut self, compute_capability: f64) {
        self.trust = (self.trust + TRUST_REWARD).min(1.0);
        self.guardian = guardian_score(compute_capability);
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }

    /// Apply a failed query.
    pub fn record_failure(&mut self) {
        self.trust = (self.trust - TRUST_PENALTY).max(MIN_TRUST);
    }
}

/// One successful poll of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Compute utilization fraction.
    pub compute_utilization: f64,
    /// Memory utilization fraction.
    pub memory_utilization: f64,
    /// Temperature in Celsius.
    pub temperature_c: f64,
    /// Power draw in Watts.
    pub power_watts: f64,
    /// Priority derived at poll time.
    pub priority_score: f64,
    /// Trust at poll time.
    pub trust_score: f64,
    /// Guardian at poll time.
    pub guardian_score: f64,
}

/// Point-in-time view of a node for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node identifier.
    pub id: NodeId,
    /// Device index on this host.
    pub device_index: u32,
    /// Device name.
    pub name: String,
    /// Capability band.
    pub tier: Tier,
    /// Total memory in MB.
    pub total_memory_mb: u64,
    /// Compute capability.
    pub compute_capability: f64,
    /// Current trust.
    pub trust_score: f64,
    /// Current guardian.
    pub guardian_score: f64,
    /// Breaker state of the telemetry path.
    pub breaker: BreakerState,
    /// Last successful query.
    pub last_seen: DateTime<Utc>,
}

/// A local accelerator.
pub struct ComputeNode {
    id: NodeId,
    device_index: u32,
    name: String,
    total_memory_mb: u64,
    compute_capability: f64,
    tier: Tier,
    scores: Mutex<NodeScores>,
    source: Arc<dyn TelemetrySource>,
    resilience: ResiliencePolicy,
}

impl fmt::Debug for ComputeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeNode")
            .field("id", &self.id)
            .field("device_index", &self.device_index)
            .field("name", &self.name)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl ComputeNode {
    /// Build a node for an enumerated device.
    #[must_use]
    pub fn new(
        id: NodeId,
        device: &DeviceDescriptor,
        source: Arc<dyn TelemetrySource>,
        resilience: ResiliencePolicy,
    ) -> Self {
        Self {
            id,
            device_index: device.index,
            name: device.name.clone(),
            total_memory_mb: device.total_memory_mb,
            compute_capability: device.compute_capability,
            tier: Tier::classify(device.total_memory_mb, device.compute_capability),
            scores: Mutex::new(NodeScores::new(device.compute_capability)),
            source,
            resilience,
        }
    }

    /// Node identifier.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Device index on this host.
    #[must_use]
    pub const fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total memory in MB.
    #[must_use]
    pub const fn total_memory_mb(&self) -> u64 {
        self.total_memory_mb
    }

    /// Compute capability.
    #[must_use]
    pub const fn compute_capability(&self) -> f64 {
        self.compute_capability
    }

    /// Capability band.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Copy of the current scores.
    #[must_use]
    pub fn scores(&self) -> NodeScores {
        *self.scores.lock()
    }

    /// Breaker state of the telemetry path.
    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.resilience.breaker().state()
    }

    /// Whether the last successful query is older than `threshold`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.scores.lock().last_seen.elapsed() > threshold
    }

    /// Status view for reporting.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let scores = self.scores();
        NodeStatus {
            id: self.id.clone(),
            device_index: self.device_index,
            name: self.name.clone(),
            tier: self.tier,
            total_memory_mb: self.total_memory_mb,
            compute_capability: self.compute_capability,
            trust_score: scores.trust,
            guardian_score: scores.guardian,
            breaker: self.breaker_state(),
            last_seen: scores.last_seen_at,
        }
    }

    /// Poll telemetry through the node's retry and circuit-breaker policy.
    ///
    /// # Errors
    ///
    /// Returns the last [`SwarmError::Query`](crate::SwarmError::Query) once
    /// retries are spent, [`SwarmError::CircuitOpen`](crate::SwarmError::CircuitOpen)
    /// while the breaker is open, or `Cancelled`.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<TelemetrySnapshot> {
        self.resilience
            .execute(cancel, "telemetry_poll", || self.query_once())
            .await
    }

    async fn query_once(&self) -> Result<TelemetrySnapshot> {
        match self.source.query(self.device_index).await {
            Ok(raw) => Ok(self.apply_success(raw)),
            Err(e) => {
                let mut scores = self.scores.lock();
                scores.record_failure();
                debug!(node_id = %self.id, trust = scores.trust, error = %e, "telemetry query failed");
                Err(e)
            }
        }
    }

    fn apply_success(&self, raw: RawTelemetry) -> TelemetrySnapshot {
        let mut scores = self.scores.lock();
        scores.record_success(self.compute_capability);
        let priority = priority_score(
            self.compute_capability,
            self.total_memory_mb,
            scores.trust,
            scores.guardian,
        );

        TelemetrySnapshot {
            compute_utilization: raw.compute_utilization,
            memory_utilization: raw.memory_utilization,
            temperature_c: raw.temperature_c,
            power_watts: raw.power_watts,
            priority_score: priority,
            trust_score: scores.trust,
            guardian_score: scores.guardian,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwarmError;
    use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
    use crate::telemetry::FakeTelemetrySource;
    use proptest::prelude::*;
    use test_case::test_case;

    fn device(index: u32, total_memory_mb: u64, compute_capability: f64) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: format!("GPU {index}"),
            total_memory_mb,
            compute_capability,
        }
    }

    fn reading(compute: f64, memory: f64) -> RawTelemetry {
        RawTelemetry {
            compute_utilization: compute,
            memory_utilization: memory,
            temperature_c: 55.0,
            power_watts: 120.0,
        }
    }

    fn make_node(source: &Arc<FakeTelemetrySource>, desc: &DeviceDescriptor) -> ComputeNode {
        let source: Arc<dyn TelemetrySource> = Arc::clone(source) as Arc<dyn TelemetrySource>;
        ComputeNode::new(
            NodeId::generate(),
            desc,
            source,
            ResiliencePolicy::new(RetryPolicy::default(), CircuitBreakerConfig::default()),
        )
    }

    #[test_case(1024, 8.9, Tier::Minimal ; "small memory")]
    #[test_case(32768, 2.1, Tier::Minimal ; "old architecture")]
    #[test_case(2048, 6.1, Tier::Entry ; "entry lower bound")]
    #[test_case(4095, 7.5, Tier::Entry ; "entry upper bound")]
    #[test_case(4096, 7.5, Tier::Mainstream ; "mainstream")]
    #[test_case(12288, 8.6, Tier::Performance ; "performance")]
    #[test_case(16384, 8.9, Tier::Enthusiast ; "enthusiast")]
    #[test_case(24576, 8.9, Tier::Flagship ; "flagship boundary")]
    #[test_case(81920, 8.0, Tier::Flagship ; "datacenter")]
    fn test_tier_classification(mem: u64, cap: f64, expected: Tier) {
        assert_eq!(Tier::classify(mem, cap), expected);
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(Tier::Minimal < Tier::Entry);
        assert!(Tier::Enthusiast < Tier::Flagship);
        assert_eq!(Tier::Performance.to_string(), "performance");
    }

    #[test]
    fn test_reference_scores() {
        let guardian = guardian_score(7.5);
        assert!((guardian - 0.25).abs() < 1e-12);
        let priority = priority_score(7.5, 4096, 1.0, guardian);
        assert!((priority - 0.21875).abs() < 1e-12);
    }

    #[test]
    fn test_priority_floor() {
        let priority = priority_score(9.0, 24576, 0.1, 0.1);
        assert!((priority - MIN_PRIORITY).abs() < f64::EPSILON);
    }

    #[test]
    fn test_guardian_clamped() {
        assert!((guardian_score(12.0)).abs() < f64::EPSILON);
        assert!((guardian_score(-1.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_node_id_display_and_serde() {
        let id = NodeId::new("node-a");
        assert_eq!(id.to_string(), "node-a");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"node-a\"");
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn test_snapshot_wire_names() {
        let snapshot = TelemetrySnapshot {
            compute_utilization: 0.5,
            memory_utilization: 0.25,
            temperature_c: 60.0,
            power_watts: 200.0,
            priority_score: 0.3,
            trust_score: 1.0,
            guardian_score: 0.2,
        };
        let json = serde_json::to_value(snapshot).expect("serialize");
        for key in [
            "computeUtilization",
            "memoryUtilization",
            "temperatureC",
            "powerWatts",
            "priorityScore",
            "trustScore",
            "guardianScore",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_poll_success_updates_scores() {
        let desc = device(0, 4096, 7.5);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.4, 0.5)));
        let node = make_node(&source, &desc);
        assert_eq!(node.tier(), Tier::Mainstream);

        let snapshot = node.poll(&CancellationToken::new()).await.expect("poll");
        assert!((snapshot.compute_utilization - 0.4).abs() < f64::EPSILON);
        assert!((snapshot.trust_score - 1.0).abs() < f64::EPSILON);
        assert!((snapshot.guardian_score - 0.25).abs() < 1e-12);
        assert!((snapshot.priority_score - 0.21875).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_lowers_trust_per_attempt() {
        let desc = device(0, 8192, 8.6);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.1, 0.1)));
        source.fail_next_queries(0, 2);
        let node = make_node(&source, &desc);

        let snapshot = node.poll(&CancellationToken::new()).await.expect("third attempt succeeds");
        assert_eq!(source.query_count(0), 3);
        // 1.0 - 0.1 - 0.1 + 0.01
        assert!((snapshot.trust_score - 0.81).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_exhaustion_propagates_query_error() {
        let desc = device(2, 8192, 8.6);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.1, 0.1)));
        source.fail_always(2);
        let node = make_node(&source, &desc);

        let err = node.poll(&CancellationToken::new()).await.expect_err("exhausted");
        assert!(matches!(err, SwarmError::Query { device_index: 2, .. }));
        assert_eq!(source.query_count(2), 3);
        assert!((node.scores().trust - 0.7).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_repeated_faults() {
        let desc = device(0, 8192, 8.6);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.1, 0.1)));
        source.fail_always(0);
        let node = make_node(&source, &desc);
        let cancel = CancellationToken::new();

        // 3 + 2 faults trip the breaker on the fifth
        assert!(node.poll(&cancel).await.is_err());
        let err = node.poll(&cancel).await.expect_err("tripped");
        assert!(matches!(err, SwarmError::CircuitOpen { .. }));
        assert_eq!(source.query_count(0), 5);
        assert_eq!(node.breaker_state(), BreakerState::Open);

        let err = node.poll(&cancel).await.expect_err("still open");
        assert!(matches!(err, SwarmError::CircuitOpen { .. }));
        assert_eq!(source.query_count(0), 5);
        // rejected calls never touch trust
        assert!((node.scores().trust - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_tracks_last_success() {
        let desc = device(0, 8192, 8.6);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.1, 0.1)));
        let node = make_node(&source, &desc);
        let threshold = Duration::from_secs(60);

        assert!(!node.is_stale(threshold));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(node.is_stale(threshold));

        node.poll(&CancellationToken::new()).await.expect("poll");
        assert!(!node.is_stale(threshold));
    }

    #[test]
    fn test_status_view() {
        let desc = device(1, 24576, 8.9);
        let source = Arc::new(FakeTelemetrySource::new().with_device(desc.clone(), reading(0.1, 0.1)));
        let node = make_node(&source, &desc);
        let status = node.status();
        assert_eq!(status.device_index, 1);
        assert_eq!(status.tier, Tier::Flagship);
        assert_eq!(status.breaker, BreakerState::Closed);
    }

    proptest! {
        #[test]
        fn prop_scores_stay_bounded(
            cap in 0.0f64..12.0,
            outcomes in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let mut scores = NodeScores::new(cap);
            for ok in outcomes {
                if ok {
                    scores.record_success(cap);
                } else {
                    scores.record_failure();
                }
                prop_assert!((MIN_TRUST..=1.0).contains(&scores.trust));
                prop_assert!((0.0..=1.0).contains(&scores.guardian));
            }
        }

        #[test]
        fn prop_priority_never_below_floor(
            cap in 0.0f64..12.0,
            mem in 0u64..200_000,
            trust in 0.1f64..=1.0,
            guardian in 0.0f64..=1.0,
        ) {
            prop_assert!(priority_score(cap, mem, trust, guardian) >= MIN_PRIORITY);
        }
    }
}
