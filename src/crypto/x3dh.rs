//! X3DH-style key agreement
//!
//! Produces the shared secret a session ratchet is seeded from, without the
//! two parties having interacted before. The initiator works from the
//! responder's published prekey bundle; the responder reconstructs the same
//! secret from the initiator's identity and ephemeral keys.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::keys::{IdentityKeyPair, OneTimePrekey, PrekeyBundle, SignedPrekey};

/// Info string for HKDF
const X3DH_INFO: &[u8] = b"cipherlink-x3dh";

/// Outcome of a key agreement
pub struct Agreement {
    shared_secret: [u8; 32],
    /// Ephemeral public key the initiator must transmit to the responder
    pub ephemeral_public: X25519PublicKey,
    /// One-time prekey consumed by this agreement, if any
    pub used_one_time_prekey_id: Option<u32>,
}

impl Agreement {
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}

impl Drop for Agreement {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Key agreement errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum X3dhError {
    #[error("Invalid prekey bundle signature")]
    SignatureInvalid,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Initiator side: agree against the peer's published prekey bundle.
///
/// Fails with `SignatureInvalid` before any DH computation if the bundle's
/// prekey signature does not check out against its identity key.
pub fn initiator_agree(
    identity: &IdentityKeyPair,
    peer_bundle: &PrekeyBundle,
) -> Result<Agreement, X3dhError> {
    if !peer_bundle.verify() {
        return Err(X3dhError::SignatureInvalid);
    }

    let ephemeral_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_private);

    let peer_identity = peer_bundle.identity_key.public_key();
    let peer_prekey = peer_bundle.prekey_public();

    // DH1 = DH(IK_A, SPK_B)
    let dh1 = identity.private_key().diffie_hellman(&peer_prekey);
    // DH2 = DH(EK_A, IK_B)
    let dh2 = ephemeral_private.diffie_hellman(&peer_identity);
    // DH3 = DH(EK_A, SPK_B)
    let dh3 = ephemeral_private.diffie_hellman(&peer_prekey);
    // DH4 = DH(EK_A, OPK_B) when a one-time prekey is present
    let dh4 = peer_bundle
        .one_time_public()
        .map(|(_, opk)| ephemeral_private.diffie_hellman(&opk));

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(dh1.as_bytes());
    dh_concat.extend_from_slice(dh2.as_bytes());
    dh_concat.extend_from_slice(dh3.as_bytes());
    if let Some(ref dh4) = dh4 {
        dh_concat.extend_from_slice(dh4.as_bytes());
    }

    let shared_secret = kdf(&dh_concat)?;
    dh_concat.zeroize();

    Ok(Agreement {
        shared_secret,
        ephemeral_public,
        used_one_time_prekey_id: peer_bundle.one_time_public().map(|(id, _)| id),
    })
}

/// Responder side: reconstruct the secret from the initiator's keys.
pub fn responder_agree(
    identity: &IdentityKeyPair,
    signed_prekey: &SignedPrekey,
    one_time_prekey: Option<&OneTimePrekey>,
    peer_identity_key: &X25519PublicKey,
    peer_ephemeral_key: &X25519PublicKey,
) -> Result<Agreement, X3dhError> {
    // Same DH values as the initiator, roles reversed
    let dh1 = signed_prekey.private_key().diffie_hellman(peer_identity_key);
    let dh2 = identity.private_key().diffie_hellman(peer_ephemeral_key);
    let dh3 = signed_prekey.private_key().diffie_hellman(peer_ephemeral_key);
    let dh4 = one_time_prekey.map(|opk| opk.private_key().diffie_hellman(peer_ephemeral_key));

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(dh1.as_bytes());
    dh_concat.extend_from_slice(dh2.as_bytes());
    dh_concat.extend_from_slice(dh3.as_bytes());
    if let Some(ref dh4) = dh4 {
        dh_concat.extend_from_slice(dh4.as_bytes());
    }

    let shared_secret = kdf(&dh_concat)?;
    dh_concat.zeroize();

    Ok(Agreement {
        shared_secret,
        ephemeral_public: *peer_ephemeral_key,
        used_one_time_prekey_id: one_time_prekey.map(|k| k.id),
    })
}

/// Key derivation: HKDF-SHA256 over 0xFF padding plus the concatenated DH
/// outputs
fn kdf(input: &[u8]) -> Result<[u8; 32], X3dhError> {
    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(input);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut output = [0u8; 32];
    hk.expand(X3DH_INFO, &mut output)
        .map_err(|_| X3dhError::KeyDerivationFailed)?;

    ikm.zeroize();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_matches() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekey = SignedPrekey::generate(1, &bob);
        let bob_otpk = OneTimePrekey::generate(1);

        let bundle = PrekeyBundle::new(&bob, &bob_prekey, Some(&bob_otpk));

        let initiator = initiator_agree(&alice, &bundle).unwrap();
        let responder = responder_agree(
            &bob,
            &bob_prekey,
            Some(&bob_otpk),
            &alice.public_key(),
            &initiator.ephemeral_public,
        )
        .unwrap();

        assert_eq!(initiator.shared_secret(), responder.shared_secret());
        assert_eq!(initiator.used_one_time_prekey_id, Some(1));
    }

    #[test]
    fn test_agreement_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekey = SignedPrekey::generate(1, &bob);

        let bundle = PrekeyBundle::new(&bob, &bob_prekey, None);

        let initiator = initiator_agree(&alice, &bundle).unwrap();
        let responder = responder_agree(
            &bob,
            &bob_prekey,
            None,
            &alice.public_key(),
            &initiator.ephemeral_public,
        )
        .unwrap();

        assert_eq!(initiator.shared_secret(), responder.shared_secret());
        assert!(initiator.used_one_time_prekey_id.is_none());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let wrong_signer = IdentityKeyPair::generate();
        let forged_prekey = SignedPrekey::generate(1, &wrong_signer);

        let bundle = PrekeyBundle::new(&bob, &forged_prekey, None);

        let result = initiator_agree(&alice, &bundle);
        assert!(matches!(result, Err(X3dhError::SignatureInvalid)));
    }

    #[test]
    fn test_missing_one_time_prekey_diverges() {
        // Responder that lost the one-time prekey derives a different secret;
        // the mismatch must not silently agree.
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekey = SignedPrekey::generate(1, &bob);
        let bob_otpk = OneTimePrekey::generate(9);

        let bundle = PrekeyBundle::new(&bob, &bob_prekey, Some(&bob_otpk));

        let initiator = initiator_agree(&alice, &bundle).unwrap();
        let responder = responder_agree(
            &bob,
            &bob_prekey,
            None,
            &alice.public_key(),
            &initiator.ephemeral_public,
        )
        .unwrap();

        assert_ne!(initiator.shared_secret(), responder.shared_secret());
    }
}
