//! Integration tests for the crypto engine

use crate::crypto::keys::{IdentityKeyPair, OneTimePrekey, PrekeyBundle, SignedPrekey};
use crate::crypto::session::CryptoSession;
use crate::crypto::x3dh;

fn establish(
    initiator: &IdentityKeyPair,
    responder: &IdentityKeyPair,
    responder_prekey: &SignedPrekey,
    responder_otpk: Option<&OneTimePrekey>,
) -> (CryptoSession, CryptoSession) {
    let bundle = PrekeyBundle::new(responder, responder_prekey, responder_otpk);

    let init_agreement = x3dh::initiator_agree(initiator, &bundle).unwrap();
    let resp_agreement = x3dh::responder_agree(
        responder,
        responder_prekey,
        responder_otpk,
        &initiator.public_key(),
        &init_agreement.ephemeral_public,
    )
    .unwrap();

    (
        CryptoSession::init_initiator(
            init_agreement.shared_secret(),
            &responder_prekey.public_key(),
        ),
        CryptoSession::init_responder(
            resp_agreement.shared_secret(),
            responder_prekey.private_key(),
        ),
    )
}

#[test]
fn test_full_protocol_flow() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_prekey = SignedPrekey::generate(1, &bob);
    let bob_otpk = OneTimePrekey::generate(1);

    let (mut alice_session, mut bob_session) =
        establish(&alice, &bob, &bob_prekey, Some(&bob_otpk));

    let messages = vec![
        ("alice", "Hey, this is a secure message!"),
        ("bob", "Got it, replying over the same session."),
        ("alice", "Each message takes a fresh key."),
        ("bob", "And old keys are gone for good."),
    ];

    for (sender, text) in messages {
        if sender == "alice" {
            let encrypted = alice_session.encrypt(text.as_bytes()).unwrap();
            assert_eq!(bob_session.decrypt(&encrypted).unwrap(), text.as_bytes());
        } else {
            let encrypted = bob_session.encrypt(text.as_bytes()).unwrap();
            assert_eq!(alice_session.decrypt(&encrypted).unwrap(), text.as_bytes());
        }
    }
}

#[test]
fn test_multiple_sessions_same_identity() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let carol = IdentityKeyPair::generate();

    let bob_prekey = SignedPrekey::generate(1, &bob);
    let carol_prekey = SignedPrekey::generate(1, &carol);

    let (mut alice_bob, mut bob_session) = establish(&alice, &bob, &bob_prekey, None);
    let (mut alice_carol, mut carol_session) = establish(&alice, &carol, &carol_prekey, None);

    let enc = alice_bob.encrypt(b"for bob only").unwrap();
    assert_eq!(bob_session.decrypt(&enc).unwrap(), b"for bob only");

    let enc = alice_carol.encrypt(b"for carol only").unwrap();
    assert_eq!(carol_session.decrypt(&enc).unwrap(), b"for carol only");
}

#[test]
fn test_one_time_prekey_id_reported() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_prekey = SignedPrekey::generate(1, &bob);
    let bob_otpk = OneTimePrekey::generate(42);

    let bundle = PrekeyBundle::new(&bob, &bob_prekey, Some(&bob_otpk));
    let agreement = x3dh::initiator_agree(&alice, &bundle).unwrap();

    assert_eq!(agreement.used_one_time_prekey_id, Some(42));
}

#[test]
fn test_large_message_encryption() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_prekey = SignedPrekey::generate(1, &bob);

    let (mut alice_session, mut bob_session) = establish(&alice, &bob, &bob_prekey, None);

    let large_msg = vec![0x42u8; 1024 * 1024];
    let encrypted = alice_session.encrypt(&large_msg).unwrap();
    assert_eq!(bob_session.decrypt(&encrypted).unwrap(), large_msg);
}

#[test]
fn test_empty_message_encryption() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_prekey = SignedPrekey::generate(1, &bob);

    let (mut alice_session, mut bob_session) = establish(&alice, &bob, &bob_prekey, None);

    let encrypted = alice_session.encrypt(&[]).unwrap();
    assert!(bob_session.decrypt(&encrypted).unwrap().is_empty());
}
