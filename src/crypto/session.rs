//! Opaque per-peer session objects
//!
//! The rest of the crate treats a `CryptoSession` as a black box: initialize
//! it from a key agreement, feed it plaintext or `RatchetMessage`s, and
//! persist whatever `serialize` returns. Every encrypt/decrypt mutates the
//! session in place, so the caller must write the new serialized state out
//! after each successful call.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::ratchet::{
    DoubleRatchet, EncryptedPayload, MessageHeader, RatchetError, RatchetState,
};
use crate::crypto::x3dh::X3dhError;
use crate::util::serde_b64;

/// A secure messaging session with one peer
pub struct CryptoSession {
    ratchet: DoubleRatchet,
}

impl CryptoSession {
    /// Create the initiator-side session from an agreed shared secret
    pub fn init_initiator(shared_secret: &[u8; 32], responder_prekey: &X25519PublicKey) -> Self {
        Self {
            ratchet: DoubleRatchet::init_initiator(shared_secret, responder_prekey),
        }
    }

    /// Create the responder-side session from an agreed shared secret.
    ///
    /// The responder's sending chain only comes into existence once the
    /// initiator's first message has been decrypted; see `can_send`.
    pub fn init_responder(shared_secret: &[u8; 32], prekey_private: &StaticSecret) -> Self {
        Self {
            ratchet: DoubleRatchet::init_responder(shared_secret, prekey_private),
        }
    }

    /// Whether this session has sending key material yet
    pub fn can_send(&self) -> bool {
        self.ratchet.can_send()
    }

    /// Our current ratchet public key
    pub fn ratchet_key(&self) -> X25519PublicKey {
        self.ratchet.public_key()
    }

    /// Encrypt a message, advancing the ratchet
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let payload = self.ratchet.encrypt(plaintext)?;
        Ok(RatchetMessage {
            header_dh_public: payload.header.dh_public.to_bytes(),
            header_prev_chain_length: payload.header.prev_chain_length,
            header_message_number: payload.header.message_number,
            ciphertext: payload.ciphertext,
        })
    }

    /// Decrypt a message, advancing the ratchet
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let payload = EncryptedPayload {
            header: MessageHeader {
                dh_public: X25519PublicKey::from(message.header_dh_public),
                prev_chain_length: message.header_prev_chain_length,
                message_number: message.header_message_number,
            },
            ciphertext: message.ciphertext.clone(),
        };

        Ok(self.ratchet.decrypt(&payload)?)
    }

    /// Serialize the full session state for persistence
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(&self.ratchet.to_state()).unwrap_or_default()
    }

    /// Rebuild a session from persisted bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        let state: RatchetState =
            serde_json::from_slice(bytes).map_err(|_| CryptoError::InvalidState)?;
        Ok(Self {
            ratchet: DoubleRatchet::from_state(&state),
        })
    }
}

/// Wire form of one ratchet message: header plus ciphertext
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetMessage {
    #[serde(with = "serde_b64::key32")]
    pub header_dh_public: [u8; 32],
    pub header_prev_chain_length: u32,
    pub header_message_number: u32,
    #[serde(with = "serde_b64")]
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes).map_err(|_| CryptoError::InvalidMessage)
    }
}

/// Crypto engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("Key agreement error: {0}")]
    Agreement(#[from] X3dhError),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("Session state could not be decoded")]
    InvalidState,
    #[error("Ratchet message could not be decoded")]
    InvalidMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{IdentityKeyPair, OneTimePrekey, PrekeyBundle, SignedPrekey};
    use crate::crypto::x3dh;

    fn session_pair() -> (CryptoSession, CryptoSession) {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekey = SignedPrekey::generate(1, &bob);
        let bob_otpk = OneTimePrekey::generate(1);
        let bundle = PrekeyBundle::new(&bob, &bob_prekey, Some(&bob_otpk));

        let alice_agreement = x3dh::initiator_agree(&alice, &bundle).unwrap();
        let bob_agreement = x3dh::responder_agree(
            &bob,
            &bob_prekey,
            Some(&bob_otpk),
            &alice.public_key(),
            &alice_agreement.ephemeral_public,
        )
        .unwrap();

        (
            CryptoSession::init_initiator(
                alice_agreement.shared_secret(),
                &bob_prekey.public_key(),
            ),
            CryptoSession::init_responder(bob_agreement.shared_secret(), bob_prekey.private_key()),
        )
    }

    #[test]
    fn test_session_establishment_and_exchange() {
        let (mut alice, mut bob) = session_pair();

        let msg = alice.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt(&msg).unwrap(), b"hello");

        let reply = bob.encrypt(b"hi").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"hi");
    }

    #[test]
    fn test_responder_send_before_first_message_fails() {
        let (_alice, mut bob) = session_pair();
        assert!(!bob.can_send());
        assert!(matches!(
            bob.encrypt(b"premature"),
            Err(CryptoError::Ratchet(RatchetError::SendNotReady))
        ));
    }

    #[test]
    fn test_serialize_roundtrip_continues_identically() {
        let (mut alice, mut bob) = session_pair();

        let msg = alice.encrypt(b"first").unwrap();
        bob.decrypt(&msg).unwrap();

        // Both sides persist and restore; the ratchet must continue exactly
        // where the live sessions left off
        let mut alice = CryptoSession::deserialize(&alice.serialize()).unwrap();
        let mut bob = CryptoSession::deserialize(&bob.serialize()).unwrap();

        for i in 0..3 {
            let text = format!("still in sync {}", i);
            let msg = bob.encrypt(text.as_bytes()).unwrap();
            assert_eq!(alice.decrypt(&msg).unwrap(), text.as_bytes());

            let msg = alice.encrypt(text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&msg).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        assert!(matches!(
            CryptoSession::deserialize(b"not a session"),
            Err(CryptoError::InvalidState)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut alice, mut bob) = session_pair();

        let mut msg = alice.encrypt(b"integrity").unwrap();
        if let Some(byte) = msg.ciphertext.last_mut() {
            *byte ^= 0xFF;
        }

        assert!(matches!(
            bob.decrypt(&msg),
            Err(CryptoError::Ratchet(RatchetError::DecryptionFailed))
        ));
    }

    #[test]
    fn test_ratchet_message_bytes_roundtrip() {
        let (mut alice, _) = session_pair();
        let msg = alice.encrypt(b"wire form").unwrap();
        let restored = RatchetMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(msg, restored);
    }
}
