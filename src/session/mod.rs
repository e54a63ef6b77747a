//! Session layer: handshake state machine, contact directory, durable store

pub mod contact;
pub mod manager;
pub mod store;

pub use contact::{ContactDirectory, ContactRecord, TrustOrigin};
pub use manager::{
    HandshakeOutcome, PeerSession, Role, SessionError, SessionManager, SessionPhase,
};
pub use store::{PrekeyStoreState, StateStore, StoreError};
