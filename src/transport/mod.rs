//! Transport Router: direct peer channels with signaling-relay fallback

pub mod direct;
pub mod link;
pub mod router;

pub use direct::{DirectChannel, DirectConnector, MemoryDirectNet, TcpDirectConnector};
pub use link::LinkPhase;
pub use router::{CiphertextCallback, RouterConfig, StateCallback, TransportRouter};

use crate::signaling::SignalingError;

/// Transport errors. Everything here is recoverable: a failed direct path
/// falls back to the relay, and a failed relay publish is reported
/// per-operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Dial failed: {0}")]
    DialFailed(String),
    #[error("Frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("Relay publish failed: {0}")]
    Relay(#[from] SignalingError),
}
