//! Gossip dissemination of node telemetry between coordinators.
//!
//! ## Architecture
//!
//! - [`GossipEnvelope`]: Wire message, `{"nodeId", "snapshot"}` as a WebSocket text frame
//! - [`GossipTransport`]: One request/reply exchange with a peer
//! - [`GossipChannel`]: Concurrent push to all peers with per-peer retry
//! - [`serve`]: Responder side, answering pushes with the local primary snapshot

mod channel;
mod message;
mod server;
mod transport;

pub use channel::{GossipChannel, GossipReport};
pub use message::GossipEnvelope;
pub use server::{GossipHandler, serve};
pub use transport::{FakeGossipTransport, GossipTransport, WebSocketTransport};
