//! # claw-swarm
//!
//! Fault-tolerant coordination for a heterogeneous fleet of GPU accelerators.
//!
//! This crate provides:
//!
//! - Per-device telemetry polling behind retry and circuit breaking
//! - Trust, guardian and fairness-aware priority scores per device
//! - Adaptive batch sizing under a memory budget
//! - Best-effort gossip of device state between coordinators
//! - Load-skew driven rebalancing and escalating alert levels
//!
//! ## Core Types
//!
//! - [`SwarmCoordinator`]: Owns the node arena, peers and state cache; runs rounds
//! - [`ComputeNode`]: One accelerator with its scores and resilience policy
//! - [`AllocationOracle`]: Per-node batch-size predictor with bounded history
//! - [`TelemetrySource`]: Hardware interface ([`NvidiaSmiSource`], [`FakeTelemetrySource`])
//! - [`GossipTransport`]: Peer exchange ([`WebSocketTransport`], [`FakeGossipTransport`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use claw_swarm::{NvidiaSmiSource, SwarmConfig, SwarmCoordinator, WebSocketTransport};
//!
//! # async fn run() -> claw_swarm::Result<()> {
//! let config = SwarmConfig::default();
//! let transport = WebSocketTransport::new(config.gossip.attempt_timeout());
//! let coordinator = SwarmCoordinator::new(
//!     config,
//!     Arc::new(NvidiaSmiSource::new()),
//!     Arc::new(transport),
//! )?;
//!
//! let round = coordinator.run_round("inference", 1024).await?;
//! for node in &round.nodes {
//!     println!("{} -> {:?}", node.name, node.outcome.batch_size());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod node;
pub mod oracle;
pub mod peers;
pub mod resilience;
pub mod telemetry;

pub use alerts::AlertAggregator;
pub use cache::{CachedState, Origin, StateCache};
pub use config::SwarmConfig;
pub use coordinator::{
    CachedNode, FleetStatus, NodeRoundResult, RebalanceAdjustment, RebalanceReport, RoundOutcome,
    RoundResult, RoundVisual, SwarmCoordinator,
};
pub use error::{Result, SwarmError};
pub use gossip::{
    FakeGossipTransport, GossipChannel, GossipEnvelope, GossipHandler, GossipReport,
    GossipTransport, WebSocketTransport,
};
pub use node::{ComputeNode, NodeId, NodeStatus, TelemetrySnapshot, Tier};
pub use oracle::{AllocationOracle, HistoryRing, Prediction};
pub use peers::{PeerLink, PeerTable};
pub use resilience::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, ResiliencePolicy, RetryPolicy,
};
pub use telemetry::{
    DeviceDescriptor, FakeTelemetrySource, NvidiaSmiSource, RawTelemetry, TelemetrySource,
};
