//! Key material: identity, signed prekeys, one-time prekeys, prekey bundles
//!
//! The identity pair carries Ed25519 for signing and an X25519 key derived
//! from the same secret for key agreement. The X25519 public half doubles as
//! the peer's permanent address (`PeerKey`).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::util::serde_b64;

/// A peer's permanent address: the X25519 identity public key.
///
/// Ordering is raw byte order; the transport layer relies on it for the
/// glare tie-break.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }

    /// Unpadded url-safe base64, as used in inbox addresses and store keys.
    pub fn to_base64(&self) -> String {
        serde_b64::encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = serde_b64::decode(s).map_err(|_| KeyError::InvalidFormat)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(array))
    }
}

impl From<X25519PublicKey> for PeerKey {
    fn from(key: X25519PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix for logs; full key only where explicitly encoded
        write!(f, "{}", &self.to_base64()[..8])
    }
}

impl std::fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerKey({})", self)
    }
}

impl Serialize for PeerKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Identity key pair (Ed25519 for signing, X25519 for key exchange)
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    x25519_private: StaticSecret,
    x25519_public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        // Derive X25519 key from the Ed25519 secret bytes
        let private_bytes = signing_key.to_bytes();
        let x25519_private = StaticSecret::from(private_bytes);
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Self {
            signing_key,
            x25519_private,
            x25519_public,
        }
    }

    /// Ed25519 public key for signature verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// X25519 public key for key exchange
    pub fn public_key(&self) -> X25519PublicKey {
        self.x25519_public
    }

    /// This identity's permanent address
    pub fn peer_key(&self) -> PeerKey {
        PeerKey::from(self.x25519_public)
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.x25519_private
    }

    /// Sign data with Ed25519
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Serialize to bytes (for storage)
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Deserialize from stored bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }
}

/// Signed prekey (medium-term, signed by the identity key)
#[derive(Clone)]
pub struct SignedPrekey {
    pub id: u32,
    private_key: StaticSecret,
    public_key: X25519PublicKey,
    signature: Signature,
}

impl SignedPrekey {
    /// Generate a new signed prekey
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);
        let signature = identity.sign(public_key.as_bytes());

        Self {
            id,
            private_key,
            public_key,
            signature,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    pub fn to_state(&self) -> SignedPrekeyState {
        SignedPrekeyState {
            id: self.id,
            private_key: self.private_key.to_bytes(),
            signature: self.signature,
        }
    }

    pub fn from_state(state: &SignedPrekeyState) -> Self {
        let private_key = StaticSecret::from(state.private_key);
        let public_key = X25519PublicKey::from(&private_key);
        Self {
            id: state.id,
            private_key,
            public_key,
            signature: state.signature,
        }
    }
}

/// Persisted form of a signed prekey
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPrekeyState {
    pub id: u32,
    #[serde(with = "serde_b64::key32")]
    private_key: [u8; 32],
    #[serde(with = "serde_b64::signature")]
    signature: Signature,
}

/// One-time prekey (published once, consumed by a single handshake)
#[derive(Clone)]
pub struct OneTimePrekey {
    pub id: u32,
    private_key: StaticSecret,
    public_key: X25519PublicKey,
}

impl OneTimePrekey {
    pub fn generate(id: u32) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);
        Self {
            id,
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    pub fn to_state(&self) -> OneTimePrekeyState {
        OneTimePrekeyState {
            id: self.id,
            private_key: self.private_key.to_bytes(),
        }
    }

    pub fn from_state(state: &OneTimePrekeyState) -> Self {
        let private_key = StaticSecret::from(state.private_key);
        let public_key = X25519PublicKey::from(&private_key);
        Self {
            id: state.id,
            private_key,
            public_key,
        }
    }
}

/// Persisted form of a one-time prekey
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyState {
    pub id: u32,
    #[serde(with = "serde_b64::key32")]
    private_key: [u8; 32],
}

/// Public keys published so a peer can initiate a handshake while we are
/// offline. Old bundles are invalidated by rotation, never mutated.
#[derive(Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// X25519 identity public key (doubles as the owner's address)
    pub identity_key: PeerKey,
    /// Ed25519 verifying key authenticating the prekey signature
    #[serde(with = "serde_b64::key32")]
    pub identity_verifying_key: [u8; 32],
    pub prekey_id: u32,
    #[serde(with = "serde_b64::key32")]
    pub prekey: [u8; 32],
    #[serde(with = "serde_b64::signature")]
    pub prekey_signature: Signature,
    pub one_time_prekey: Option<OneTimeBundleKey>,
}

/// The public half of a one-time prekey inside a bundle
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimeBundleKey {
    pub id: u32,
    #[serde(with = "serde_b64::key32")]
    pub key: [u8; 32],
}

impl PrekeyBundle {
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPrekey,
        one_time_prekey: Option<&OneTimePrekey>,
    ) -> Self {
        Self {
            identity_key: identity.peer_key(),
            identity_verifying_key: identity.verifying_key().to_bytes(),
            prekey_id: signed_prekey.id,
            prekey: signed_prekey.public_key().to_bytes(),
            prekey_signature: signed_prekey.signature(),
            one_time_prekey: one_time_prekey.map(|k| OneTimeBundleKey {
                id: k.id,
                key: k.public_key().to_bytes(),
            }),
        }
    }

    pub fn prekey_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.prekey)
    }

    pub fn one_time_public(&self) -> Option<(u32, X25519PublicKey)> {
        self.one_time_prekey
            .as_ref()
            .map(|k| (k.id, X25519PublicKey::from(k.key)))
    }

    /// Verify the signed prekey signature against the identity verifying key
    pub fn verify(&self) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.identity_verifying_key) else {
            return false;
        };
        verifying_key
            .verify(&self.prekey, &self.prekey_signature)
            .is_ok()
    }
}

/// Key-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Signature verification failed")]
    SignatureInvalid,
}
