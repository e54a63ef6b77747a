//! Crypto engine: identities, key agreement, ratcheting sessions
//!
//! Consumed as an opaque unit by the session layer. Provides:
//! - identity and prekey generation
//! - X3DH-style key agreement
//! - double-ratchet sessions with full state serialization

pub mod keys;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use keys::{
    IdentityKeyPair, KeyError, OneTimePrekey, OneTimePrekeyState, PeerKey, PrekeyBundle,
    SignedPrekey, SignedPrekeyState,
};
pub use ratchet::RatchetError;
pub use session::{CryptoError, CryptoSession, RatchetMessage};
pub use x3dh::X3dhError;

#[cfg(test)]
mod tests;
