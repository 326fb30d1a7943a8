//! Best-effort push of a snapshot to every peer.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::GossipEnvelope;
use super::transport::GossipTransport;
use crate::node::NodeId;
use crate::peers::PeerLink;
use crate::resilience::{RetryPolicy, retry_with_backoff};

/// Outcome of one push round.
#[derive(Debug, Clone, Default)]
pub struct GossipReport {
    /// Peers that answered, with their replies.
    pub delivered: Vec<(NodeId, GossipEnvelope)>,
    /// Peers that could not be reached, with the last error.
    pub failed: Vec<(NodeId, String)>,
}

/// Pushes snapshots to peers concurrently, retrying each peer on its own.
pub struct GossipChannel {
    transport: Arc<dyn GossipTransport>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GossipChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipChannel")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl GossipChannel {
    /// Create a channel over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn GossipTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Push `envelope` to every peer except the node it describes.
    ///
    /// Never fails: unreachable peers are logged and listed in the report.
    pub async fn push(
        &self,
        peers: &[PeerLink],
        envelope: &GossipEnvelope,
        cancel: &CancellationToken,
    ) -> GossipReport {
        let targets = peers.iter().filter(|p| p.node_id != envelope.node_id);

        let deliveries = targets.map(|peer| async move {
            let result = retry_with_backoff(&self.retry, cancel, "gossip_push", || {
                self.transport.exchange(&peer.uri, envelope)
            })
            .await;
            (peer, result)
        });

        let mut report = GossipReport::default();
        for (peer, result) in join_all(deliveries).await {
            match result {
                Ok(reply) => {
                    debug!(peer = %peer.node_id, from = %envelope.node_id, "gossip delivered");
                    report.delivered.push((peer.node_id.clone(), reply));
                }
                Err(e) => {
                    warn!(
                        peer = %peer.node_id,
                        uri = %peer.uri,
                        from = %envelope.node_id,
                        error = %e,
                        "gossip delivery gave up"
                    );
                    report.failed.push((peer.node_id.clone(), e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::gossip::FakeGossipTransport;
    use crate::node::TelemetrySnapshot;

    fn snapshot(compute: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            compute_utilization: compute,
            memory_utilization: 0.3,
            temperature_c: 58.0,
            power_watts: 140.0,
            priority_score: 0.2,
            trust_score: 1.0,
            guardian_score: 0.2,
        }
    }

    fn peer(id: &str) -> PeerLink {
        PeerLink {
            node_id: NodeId::new(id),
            uri: format!("ws://{id}"),
        }
    }

    fn gossip_retry() -> RetryPolicy {
        RetryPolicy {
            backoff_after_last_attempt: true,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_schedule() {
        let transport = Arc::new(
            FakeGossipTransport::new()
                .with_reply("ws://up", GossipEnvelope::new(NodeId::new("up"), snapshot(0.9))),
        );
        let channel = GossipChannel::new(transport.clone(), gossip_retry());
        let envelope = GossipEnvelope::new(NodeId::new("local"), snapshot(0.1));

        let start = Instant::now();
        let report = channel
            .push(&[peer("down"), peer("up")], &envelope, &CancellationToken::new())
            .await;

        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].0, NodeId::new("up"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, NodeId::new("down"));

        let offsets: Vec<_> = transport
            .attempt_times("ws://down")
            .into_iter()
            .map(|t| t - start)
            .collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(3)]
        );
        // the final delay is also waited out
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(transport.attempts("ws://up"), 1);
    }

    #[tokio::test]
    async fn test_skips_own_node() {
        let transport = Arc::new(FakeGossipTransport::new());
        let channel = GossipChannel::new(transport.clone(), gossip_retry());
        let envelope = GossipEnvelope::new(NodeId::new("self"), snapshot(0.1));

        let report = channel
            .push(&[peer("self")], &envelope, &CancellationToken::new())
            .await;

        assert!(report.delivered.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(transport.attempts("ws://self"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_contacted_concurrently() {
        let transport = Arc::new(FakeGossipTransport::new());
        let channel = GossipChannel::new(transport.clone(), gossip_retry());
        let envelope = GossipEnvelope::new(NodeId::new("local"), snapshot(0.1));

        let start = Instant::now();
        let report = channel
            .push(
                &[peer("a"), peer("b"), peer("c")],
                &envelope,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.failed.len(), 3);
        // schedules overlap instead of adding up
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_backoff() {
        let transport = Arc::new(FakeGossipTransport::new());
        let channel = GossipChannel::new(transport.clone(), gossip_retry());
        let envelope = GossipEnvelope::new(NodeId::new("local"), snapshot(0.1));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let report = channel.push(&[peer("a")], &envelope, &cancel).await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("cancelled"));
        assert_eq!(transport.attempts("ws://a"), 2);
    }
}
