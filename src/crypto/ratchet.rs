//! Double Ratchet for per-message key derivation
//!
//! Seeded from an X3DH shared secret. The initiator can send immediately;
//! the responder has no sending chain until the first inbound message
//! triggers a DH ratchet step. Callers observe that via `can_send` and get
//! `SendNotReady` instead of ciphertext the peer could never place in its
//! own ratchet.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::Hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::util::serde_b64;

type HmacSha256 = Hmac<Sha256>;

/// Chain key for the symmetric ratchet
#[derive(Clone)]
struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derive the next message key and advance the chain
    fn next(&mut self) -> [u8; 32] {
        let message_key = self.derive_key(0x01);
        self.key = self.derive_key(0x02);
        self.index += 1;
        message_key
    }

    fn derive_key(&self, constant: u8) -> [u8; 32] {
        use hmac::Mac;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&[constant]);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Double Ratchet state
pub struct DoubleRatchet {
    /// DH ratchet key pair
    dh_private: StaticSecret,
    dh_public: X25519PublicKey,
    /// Remote party's current DH ratchet public key
    remote_public: Option<X25519PublicKey>,
    /// Root key
    root_key: [u8; 32],
    /// Sending chain (absent on the responder side until the first DH ratchet)
    sending_chain: Option<ChainKey>,
    /// Receiving chain
    receiving_chain: Option<ChainKey>,
    /// Message counters
    send_count: u32,
    recv_count: u32,
    /// Previous sending chain length
    prev_send_count: u32,
}

impl DoubleRatchet {
    /// Initialize as the initiator with the shared secret from key agreement.
    ///
    /// Performs the first DH against the responder's signed prekey, so a
    /// sending chain exists immediately.
    pub fn init_initiator(shared_secret: &[u8; 32], responder_prekey: &X25519PublicKey) -> Self {
        let dh_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh_public = X25519PublicKey::from(&dh_private);

        let dh_output = dh_private.diffie_hellman(responder_prekey);
        let (root_key, chain_key) = kdf_rk(shared_secret, dh_output.as_bytes());

        Self {
            dh_private,
            dh_public,
            remote_public: Some(*responder_prekey),
            root_key,
            sending_chain: Some(ChainKey::new(chain_key)),
            receiving_chain: None,
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
        }
    }

    /// Initialize as the responder with the shared secret from key agreement.
    ///
    /// The ratchet key pair is the signed prekey the initiator agreed
    /// against. No chains exist yet: the initiator's first message header
    /// carries the ratchet key that seeds them. Until then `encrypt` fails
    /// with `SendNotReady`.
    pub fn init_responder(shared_secret: &[u8; 32], prekey_private: &StaticSecret) -> Self {
        let dh_public = X25519PublicKey::from(prekey_private);

        Self {
            dh_private: prekey_private.clone(),
            dh_public,
            remote_public: None,
            root_key: *shared_secret,
            sending_chain: None,
            receiving_chain: None,
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
        }
    }

    /// Our current DH ratchet public key
    pub fn public_key(&self) -> X25519PublicKey {
        self.dh_public
    }

    /// Whether a sending chain exists yet
    pub fn can_send(&self) -> bool {
        self.sending_chain.is_some()
    }

    /// Encrypt a message, advancing the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedPayload, RatchetError> {
        let chain = self.sending_chain.as_mut().ok_or(RatchetError::SendNotReady)?;

        let message_key = chain.next();
        let ciphertext = aead_encrypt(&message_key, plaintext)?;

        self.send_count += 1;

        Ok(EncryptedPayload {
            header: MessageHeader {
                dh_public: self.dh_public,
                prev_chain_length: self.prev_send_count,
                message_number: chain.index - 1,
            },
            ciphertext,
        })
    }

    /// Decrypt a message, advancing the receiving chain and performing a DH
    /// ratchet step when the sender's ratchet key changed
    pub fn decrypt(&mut self, payload: &EncryptedPayload) -> Result<Vec<u8>, RatchetError> {
        let need_ratchet = self
            .remote_public
            .map(|pk| pk != payload.header.dh_public)
            .unwrap_or(true);

        if need_ratchet {
            self.dh_ratchet(&payload.header.dh_public);
        }

        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or(RatchetError::DecryptionFailed)?;

        let message_key = chain.next();
        let plaintext = aead_decrypt(&message_key, &payload.ciphertext)?;

        self.recv_count += 1;

        Ok(plaintext)
    }

    /// DH ratchet step: new receiving chain from their key, fresh key pair,
    /// new sending chain
    fn dh_ratchet(&mut self, their_public: &X25519PublicKey) {
        self.remote_public = Some(*their_public);
        self.prev_send_count = self.sending_chain.as_ref().map(|c| c.index).unwrap_or(0);

        let dh_recv = self.dh_private.diffie_hellman(their_public);
        let (root_key, recv_chain_key) = kdf_rk(&self.root_key, dh_recv.as_bytes());
        self.root_key = root_key;
        self.receiving_chain = Some(ChainKey::new(recv_chain_key));

        self.dh_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        self.dh_public = X25519PublicKey::from(&self.dh_private);

        let dh_send = self.dh_private.diffie_hellman(their_public);
        let (root_key, send_chain_key) = kdf_rk(&self.root_key, dh_send.as_bytes());
        self.root_key = root_key;
        self.sending_chain = Some(ChainKey::new(send_chain_key));
    }

    /// Snapshot the full ratchet state for persistence
    pub fn to_state(&self) -> RatchetState {
        RatchetState {
            dh_private: self.dh_private.to_bytes(),
            remote_public: self.remote_public.map(|pk| pk.to_bytes()),
            root_key: self.root_key,
            sending_chain: self.sending_chain.as_ref().map(ChainState::from),
            receiving_chain: self.receiving_chain.as_ref().map(ChainState::from),
            send_count: self.send_count,
            recv_count: self.recv_count,
            prev_send_count: self.prev_send_count,
        }
    }

    /// Rebuild a ratchet from persisted state
    pub fn from_state(state: &RatchetState) -> Self {
        let dh_private = StaticSecret::from(state.dh_private);
        let dh_public = X25519PublicKey::from(&dh_private);
        Self {
            dh_private,
            dh_public,
            remote_public: state.remote_public.map(X25519PublicKey::from),
            root_key: state.root_key,
            sending_chain: state.sending_chain.as_ref().map(ChainState::to_chain),
            receiving_chain: state.receiving_chain.as_ref().map(ChainState::to_chain),
            send_count: state.send_count,
            recv_count: state.recv_count,
            prev_send_count: state.prev_send_count,
        }
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

/// Serializable ratchet snapshot
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    #[serde(with = "serde_b64::key32")]
    dh_private: [u8; 32],
    remote_public: Option<[u8; 32]>,
    #[serde(with = "serde_b64::key32")]
    root_key: [u8; 32],
    sending_chain: Option<ChainState>,
    receiving_chain: Option<ChainState>,
    send_count: u32,
    recv_count: u32,
    prev_send_count: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct ChainState {
    #[serde(with = "serde_b64::key32")]
    key: [u8; 32],
    index: u32,
}

impl From<&ChainKey> for ChainState {
    fn from(chain: &ChainKey) -> Self {
        Self {
            key: chain.key,
            index: chain.index,
        }
    }
}

impl ChainState {
    fn to_chain(&self) -> ChainKey {
        ChainKey {
            key: self.key,
            index: self.index,
        }
    }
}

/// Message header carried alongside every ciphertext
#[derive(Clone, Debug)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key
    pub dh_public: X25519PublicKey,
    /// Previous sending chain length
    pub prev_chain_length: u32,
    /// Message number in the current chain
    pub message_number: u32,
}

/// Encrypted message payload
#[derive(Clone, Debug)]
pub struct EncryptedPayload {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

/// Ratchet errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RatchetError {
    #[error("No sending key material until a message from the initiator arrives")]
    SendNotReady,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Root key derivation
fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut output = [0u8; 64];
    hk.expand(b"cipherlink-ratchet", &mut output)
        .expect("64 bytes is a valid hkdf output length");

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);

    output.zeroize();
    (new_root, chain_key)
}

/// AEAD encryption, AES-256-GCM with a random nonce prepended
fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| RatchetError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(12 + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend(ciphertext);

    Ok(result)
}

/// AEAD decryption
fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
    if ciphertext.len() < 12 {
        return Err(RatchetError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::DecryptionFailed)?;

    let nonce = Nonce::from_slice(&ciphertext[..12]);
    cipher
        .decrypt(nonce, &ciphertext[12..])
        .map_err(|_| RatchetError::DecryptionFailed)
}
