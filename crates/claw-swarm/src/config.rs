//! Coordinator configuration.
//!
//! Configuration for the swarm coordinator, including:
//! - Resilience policy around telemetry queries
//! - Discovery and gossip retry schedules
//! - Round, rebalance and oracle tuning
//! - Statically configured peers

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Retry schedule: fixed attempt budget with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each further failure.
    pub backoff_multiplier: f64,
    /// Whether the final failed attempt is also followed by its backoff delay.
    pub backoff_after_last_attempt: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_after_last_attempt: false,
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            backoff_after_last_attempt: self.backoff_after_last_attempt,
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SwarmError::Config(format!(
                "{section}.max_attempts must be greater than 0"
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(SwarmError::Config(format!(
                "{section}.backoff_multiplier must be at least 1.0"
            )));
        }
        Ok(())
    }
}

/// Retry and circuit breaking around telemetry queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry schedule for a single poll.
    pub retry: RetryConfig,
    /// Consecutive faults that open a node's breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker rejects calls before admitting a trial.
    pub cooldown_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl ResilienceConfig {
    /// Breaker parameters for one node.
    #[must_use]
    pub const fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

/// A statically configured gossip peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Remote node identifier.
    pub node_id: String,
    /// WebSocket endpoint, e.g. `ws://10.0.0.2:7420`.
    pub uri: String,
}

/// Gossip dissemination settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GossipConfig {
    /// Per-peer delivery retry schedule.
    pub retry: RetryConfig,
    /// Timeout for one connect-send-receive exchange, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Address to accept peer pushes on. `None` disables the responder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<SocketAddr>,
    /// Peers registered at startup.
    pub peers: Vec<PeerConfig>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                backoff_after_last_attempt: true,
                ..RetryConfig::default()
            },
            attempt_timeout_ms: 5000,
            listen_addr: None,
            peers: Vec::new(),
        }
    }
}

impl GossipConfig {
    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Orchestration round settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundConfig {
    /// Workload label used by the daemon loop.
    pub workload: String,
    /// Model size in MB used by the daemon loop.
    pub model_size_mb: u64,
    /// Seconds between rounds in the daemon loop.
    pub interval_secs: u64,
    /// A node unseen for longer than this is flagged stale.
    pub stale_after_secs: u64,
    /// Nodes whose priority exceeds this get their batch halved.
    pub protective_priority_threshold: f64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            workload: "fleet-computation".to_string(),
            model_size_mb: 1024,
            interval_secs: 30,
            stale_after_secs: 60,
            protective_priority_threshold: 0.7,
        }
    }
}

impl RoundConfig {
    /// Stale threshold as a [`Duration`].
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Load rebalancing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Rebalance only when `max(load) - min(load)` exceeds this.
    pub skew_threshold: f64,
    /// Local nodes above this compute utilization are shrunk.
    pub hot_utilization: f64,
    /// Model size in MB for the first corrective prediction.
    pub model_size_mb: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            skew_threshold: 0.3,
            hot_utilization: 0.8,
            model_size_mb: 1024,
        }
    }
}

/// Batch-size oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// Number of past decisions kept per node.
    pub history_capacity: usize,
    /// Memory reserve factor applied to the model size.
    pub headroom_factor: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            headroom_factor: 1.1,
        }
    }
}

/// Telemetry backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Custom nvidia-smi path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvidia_smi_path: Option<String>,
}

/// Main coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Telemetry query resilience.
    pub resilience: ResilienceConfig,
    /// Enumeration retry schedule.
    pub discovery: RetryConfig,
    /// Gossip settings.
    pub gossip: GossipConfig,
    /// Round settings.
    pub round: RoundConfig,
    /// Rebalance settings.
    pub rebalance: RebalanceConfig,
    /// Oracle settings.
    pub oracle: OracleConfig,
    /// Telemetry backend.
    pub telemetry: TelemetryConfig,
}

impl SwarmConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SwarmError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SwarmError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SwarmError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        self.resilience.retry.validate("resilience.retry")?;
        self.discovery.validate("discovery")?;
        self.gossip.retry.validate("gossip.retry")?;

        if self.resilience.failure_threshold == 0 {
            return Err(SwarmError::Config(
                "resilience.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.gossip.attempt_timeout_ms == 0 {
            return Err(SwarmError::Config(
                "gossip.attempt_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for peer in &self.gossip.peers {
            if peer.node_id.is_empty() {
                return Err(SwarmError::Config(
                    "gossip peer node_id cannot be empty".to_string(),
                ));
            }
            if !peer.uri.starts_with("ws://") && !peer.uri.starts_with("wss://") {
                return Err(SwarmError::Config(format!(
                    "gossip peer uri '{}' must start with ws:// or wss://",
                    peer.uri
                )));
            }
        }

        if self.round.model_size_mb == 0 || self.rebalance.model_size_mb == 0 {
            return Err(SwarmError::Config(
                "model_size_mb must be greater than 0".to_string(),
            ));
        }

        if self.round.interval_secs == 0 {
            return Err(SwarmError::Config(
                "round.interval_secs must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            (
                "round.protective_priority_threshold",
                self.round.protective_priority_threshold,
            ),
            ("rebalance.skew_threshold", self.rebalance.skew_threshold),
            ("rebalance.hot_utilization", self.rebalance.hot_utilization),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SwarmError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.oracle.history_capacity == 0 {
            return Err(SwarmError::Config(
                "oracle.history_capacity must be greater than 0".to_string(),
            ));
        }

        if self.oracle.headroom_factor.is_nan() || self.oracle.headroom_factor < 1.0 {
            return Err(SwarmError::Config(
                "oracle.headroom_factor must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}
