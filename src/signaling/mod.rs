//! Signaling Channel: pub/sub envelope delivery over a rendezvous relay
//!
//! Best-effort, at-least-once, unordered across senders. Handshake and
//! transport negotiation ride on this; so does relayed ciphertext when no
//! direct channel is open.

pub mod client;
pub mod envelope;
pub mod frame;
pub mod link;

pub use client::{EnvelopeHandler, SignalingClient, SubscribeFilter, Subscription};
pub use envelope::{
    inbox_topic, Envelope, EnvelopeBody, EnvelopeKind, HandshakeInit, Presence, RelayedCiphertext,
    TransportAnswer, TransportIce, TransportOffer, Typing, BROADCAST_TOPIC,
};
pub use frame::RelayFrame;
pub use link::{MemoryConnector, MemoryHub, SignalingConnector, SignalingLink, WebSocketConnector};

/// Signaling channel errors. Transport-class failures are retryable by
/// design; none of them are fatal to the process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling unavailable after {attempts} connection attempts: {detail}")]
    Unavailable { attempts: u32, detail: String },
    #[error("Not connected to the signaling relay")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Signaling client stopped")]
    Stopped,
}
