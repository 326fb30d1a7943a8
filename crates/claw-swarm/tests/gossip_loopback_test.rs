//! Two coordinators gossiping over real WebSocket connections on loopback.

use std::sync::Arc;
use std::time::Duration;

use claw_swarm::gossip::serve;
use claw_swarm::{
    DeviceDescriptor, FakeTelemetrySource, NodeId, Origin, RawTelemetry, SwarmConfig,
    SwarmCoordinator, WebSocketTransport,
};
use tokio::net::TcpListener;

fn fleet(compute: f64) -> FakeTelemetrySource {
    FakeTelemetrySource::new().with_device(
        DeviceDescriptor {
            index: 0,
            name: "NVIDIA GeForce RTX 4090".to_string(),
            total_memory_mb: 24564,
            compute_capability: 8.9,
        },
        RawTelemetry {
            compute_utilization: compute,
            memory_utilization: 0.3,
            temperature_c: 64.0,
            power_watts: 320.0,
        },
    )
}

fn coordinator(compute: f64) -> Arc<SwarmCoordinator> {
    let config = SwarmConfig::default();
    let transport = WebSocketTransport::new(Duration::from_secs(5));
    Arc::new(
        SwarmCoordinator::new(config, Arc::new(fleet(compute)), Arc::new(transport))
            .expect("valid config"),
    )
}

#[tokio::test]
async fn test_round_exchanges_state_with_peer() {
    let local = coordinator(0.2);
    let remote = coordinator(0.9);
    remote.discover().await.expect("remote discover");
    let remote_id = remote.nodes()[0].id().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve(
        listener,
        remote.clone(),
        remote.shutdown_token(),
    ));

    assert!(local.register_peer(format!("ws://{addr}"), remote_id.clone()));
    let result = local.run_round("inference", 2048).await.expect("round");
    assert!(result.nodes[0].outcome.batch_size().is_some());
    let local_id = local.nodes()[0].id().clone();

    // the push landed on the remote side
    let pushed = remote.cache().get(&local_id).expect("remote cached our node");
    assert_eq!(pushed.origin, Origin::Remote);
    assert!((pushed.snapshot.compute_utilization - 0.2).abs() < f64::EPSILON);

    // the reply landed on our side
    let reply = local.cache().get(&remote_id).expect("local cached remote node");
    assert_eq!(reply.origin, Origin::Remote);
    assert!((reply.snapshot.compute_utilization - 0.9).abs() < f64::EPSILON);

    let status = local.status();
    assert_eq!(status.cached.len(), 2);
    assert!((status.swarm_load - 0.55).abs() < 1e-9);

    remote.shutdown();
    server
        .await
        .expect("server task")
        .expect("server exits cleanly");
}

#[tokio::test]
async fn test_responder_without_local_state_gives_no_reply() {
    // never discovered, so there is no primary snapshot to answer with
    let remote = coordinator(0.5);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(listener, remote.clone(), remote.shutdown_token()));

    let local = coordinator(0.1);
    local.discover().await.expect("discover");
    let node = local.nodes()[0].clone();
    let snapshot = local.cache().get(node.id()).expect("seeded").snapshot;

    let mut config = SwarmConfig::default();
    config.gossip.retry.max_attempts = 1;
    config.gossip.retry.backoff_after_last_attempt = false;
    let quick = SwarmCoordinator::new(
        config,
        Arc::new(fleet(0.1)),
        Arc::new(WebSocketTransport::new(Duration::from_secs(5))),
    )
    .expect("valid config");
    quick.register_peer(format!("ws://{addr}"), NodeId::new("silent"));

    let report = quick.gossip(node.id().clone(), snapshot).await;
    assert!(report.delivered.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("without reply"));

    // the push was still absorbed
    assert!(remote.cache().get(node.id()).is_some());
    remote.shutdown();
}
