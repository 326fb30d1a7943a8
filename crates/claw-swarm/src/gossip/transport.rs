//! Request/reply exchange with one peer.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::message::GossipEnvelope;
use crate::error::{Result, SwarmError};

/// Delivers a push to a peer and returns the peer's reply.
pub trait GossipTransport: Send + Sync {
    /// Push `envelope` to `uri` and wait for the peer's own envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::GossipDelivery`] on any connection, protocol or
    /// timeout failure.
    fn exchange<'a>(
        &'a self,
        uri: &'a str,
        envelope: &'a GossipEnvelope,
    ) -> BoxFuture<'a, Result<GossipEnvelope>>;
}

/// WebSocket transport: one connection per exchange.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    attempt_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl WebSocketTransport {
    /// Create a transport bounding each exchange by `attempt_timeout`.
    #[must_use]
    pub const fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    async fn exchange_once(
        uri: &str,
        envelope: &GossipEnvelope,
    ) -> std::result::Result<GossipEnvelope, String> {
        let json = envelope
            .to_json()
            .map_err(|e| format!("failed to serialize: {e}"))?;

        let (mut ws, _) = connect_async(uri)
            .await
            .map_err(|e| format!("failed to connect: {e}"))?;

        ws.send(Message::text(json))
            .await
            .map_err(|e| format!("failed to send: {e}"))?;

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    break GossipEnvelope::from_json(&text)
                        .map_err(|e| format!("invalid reply: {e}"))?;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    break serde_json::from_slice::<GossipEnvelope>(&bytes)
                        .map_err(|e| format!("invalid reply: {e}"))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err("connection closed without reply".to_string());
                }
                Some(Ok(_)) => {} // ping/pong
                Some(Err(e)) => return Err(format!("failed to read reply: {e}")),
            }
        };

        let _ = ws.close(None).await;
        Ok(reply)
    }
}

impl GossipTransport for WebSocketTransport {
    fn exchange<'a>(
        &'a self,
        uri: &'a str,
        envelope: &'a GossipEnvelope,
    ) -> BoxFuture<'a, Result<GossipEnvelope>> {
        async move {
            let reason = match timeout(self.attempt_timeout, Self::exchange_once(uri, envelope)).await
            {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(reason)) => reason,
                Err(_) => format!("no reply within {}ms", self.attempt_timeout.as_millis()),
            };
            Err(SwarmError::GossipDelivery {
                peer: uri.to_string(),
                reason,
            })
        }
        .boxed()
    }
}

/// In-memory transport for testing.
///
/// Peers with a configured reply answer every push; any other endpoint is
/// unreachable. Every attempt is recorded with its (tokio) timestamp.
#[derive(Debug, Default)]
pub struct FakeGossipTransport {
    replies: Mutex<HashMap<String, GossipEnvelope>>,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    received: Mutex<HashMap<String, Vec<GossipEnvelope>>>,
}

impl FakeGossipTransport {
    /// Create a transport where every peer is unreachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `uri` reachable, answering with `reply`.
    #[must_use]
    pub fn with_reply(self, uri: impl Into<String>, reply: GossipEnvelope) -> Self {
        self.set_reply(uri, reply);
        self
    }

    /// Make `uri` reachable, answering with `reply`.
    pub fn set_reply(&self, uri: impl Into<String>, reply: GossipEnvelope) {
        self.replies.lock().insert(uri.into(), reply);
    }

    /// Make `uri` unreachable.
    pub fn disconnect(&self, uri: &str) {
        self.replies.lock().remove(uri);
    }

    /// Number of exchanges attempted against `uri`.
    #[must_use]
    pub fn attempts(&self, uri: &str) -> usize {
        self.attempts.lock().get(uri).map_or(0, Vec::len)
    }

    /// When each exchange against `uri` was attempted.
    #[must_use]
    pub fn attempt_times(&self, uri: &str) -> Vec<Instant> {
        self.attempts.lock().get(uri).cloned().unwrap_or_default()
    }

    /// Envelopes delivered to `uri`, including failed attempts.
    #[must_use]
    pub fn received(&self, uri: &str) -> Vec<GossipEnvelope> {
        self.received.lock().get(uri).cloned().unwrap_or_default()
    }
}

impl GossipTransport for FakeGossipTransport {
    fn exchange<'a>(
        &'a self,
        uri: &'a str,
        envelope: &'a GossipEnvelope,
    ) -> BoxFuture<'a, Result<GossipEnvelope>> {
        self.attempts
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push(Instant::now());
        self.received
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push(envelope.clone());

        let result = self
            .replies
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| SwarmError::GossipDelivery {
                peer: uri.to_string(),
                reason: "connection refused".to_string(),
            });
        futures::future::ready(result).boxed()
    }
}
