//! Cipherlink core library
//!
//! Session bootstrap and transport routing for end-to-end encrypted
//! messaging between two parties identified by long-lived public keys:
//! - prekey-based handshakes over a rendezvous signaling relay
//! - double-ratchet sessions persisted across process restarts
//! - direct peer channels with transparent relay fallback

pub mod config;
pub mod crypto;
pub mod orchestrator;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod util;

// Re-export the surface a client application wires against
pub use config::{Config, RetryPolicy};
pub use crypto::{IdentityKeyPair, PeerKey, PrekeyBundle};
pub use orchestrator::{Event, Orchestrator, OrchestratorError};
pub use session::{
    ContactRecord, SessionError, SessionManager, SessionPhase, StateStore, TrustOrigin,
};
pub use signaling::{
    Envelope, EnvelopeBody, EnvelopeKind, MemoryHub, SignalingClient, SignalingError,
    WebSocketConnector,
};
pub use transport::{
    LinkPhase, MemoryDirectNet, TcpDirectConnector, TransportError, TransportRouter,
};
