//! Responder side of the gossip exchange.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::GossipEnvelope;
use crate::error::Result;

/// Handles an incoming push.
pub trait GossipHandler: Send + Sync {
    /// Absorb a peer's envelope and return the reply, if any.
    ///
    /// Returning `None` closes the connection without a reply.
    fn on_push(&self, envelope: GossipEnvelope) -> Option<GossipEnvelope>;
}

/// Accept gossip connections on `listener` until `cancel` fires.
///
/// Each connection carries one push and at most one reply.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn GossipHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "gossip responder listening");

    loop {
        let (stream, remote) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept gossip connection");
                    continue;
                }
            },
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(reason) = handle_connection(stream, handler).await {
                debug!(remote = %remote, reason = %reason, "gossip connection ended");
            }
        });
    }

    info!("gossip responder stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn GossipHandler>,
) -> std::result::Result<(), String> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| format!("handshake failed: {e}"))?;

    let envelope = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                break GossipEnvelope::from_json(&text).map_err(|e| e.to_string())?;
            }
            Some(Ok(Message::Binary(bytes))) => {
                break serde_json::from_slice::<GossipEnvelope>(&bytes)
                    .map_err(|e| e.to_string())?;
            }
            Some(Ok(Message::Close(_))) | None => return Err("closed before push".to_string()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(format!("read failed: {e}")),
        }
    };

    debug!(from = %envelope.node_id, "gossip push received");

    if let Some(reply) = handler.on_push(envelope) {
        let json = reply.to_json().map_err(|e| e.to_string())?;
        ws.send(Message::text(json))
            .await
            .map_err(|e| format!("reply failed: {e}"))?;
    }

    let _ = ws.close(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::SwarmError;
    use crate::gossip::{GossipTransport, WebSocketTransport};
    use crate::node::{NodeId, TelemetrySnapshot};

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

    #[derive(Default)]
    struct RecordingHandler {
        reply: Option<GossipEnvelope>,
        seen: Mutex<Vec<GossipEnvelope>>,
    }

    impl GossipHandler for RecordingHandler {
        fn on_push(&self, envelope: GossipEnvelope) -> Option<GossipEnvelope> {
            self.seen.lock().push(envelope);
            self.reply.clone()
        }
    }

    async fn start(handler: Arc<RecordingHandler>) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, handler, cancel.clone()));
        (format!("ws://{addr}"), cancel)
    }

    #[tokio::test]
    async fn test_push_and_reply() {
        let handler = Arc::new(RecordingHandler {
            reply: Some(GossipEnvelope::new(NodeId::new("responder"), snapshot(0.8))),
            ..RecordingHandler::default()
        });
        let (uri, cancel) = start(Arc::clone(&handler)).await;

        let transport = WebSocketTransport::new(Duration::from_secs(5));
        let push = GossipEnvelope::new(NodeId::new("pusher"), snapshot(0.1));
        let reply = transport.exchange(&uri, &push).await.expect("exchange");

        assert_eq!(reply.node_id, NodeId::new("responder"));
        assert!((reply.snapshot.compute_utilization - 0.8).abs() < f64::EPSILON);
        assert_eq!(handler.seen.lock().as_slice(), &[push]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_no_reply_is_delivery_failure() {
        let handler = Arc::new(RecordingHandler::default());
        let (uri, cancel) = start(Arc::clone(&handler)).await;

        let transport = WebSocketTransport::new(Duration::from_secs(5));
        let push = GossipEnvelope::new(NodeId::new("pusher"), snapshot(0.1));
        let err = transport.exchange(&uri, &push).await.expect_err("no reply");

        assert!(matches!(err, SwarmError::GossipDelivery { .. }));
        assert_eq!(handler.seen.lock().len(), 1);
        cancel.cancel();
    }
}
