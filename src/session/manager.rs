//! Session Manager: the handshake state machine and the exclusive, durable
//! registry of per-peer sessions
//!
//! Exactly one `PeerSession` may exist per peer public key. Handshake
//! acceptance is idempotent so redelivered signaling messages are harmless,
//! and every ratchet mutation is persisted before the result is handed back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{
    x3dh, CryptoError, CryptoSession, IdentityKeyPair, KeyError, OneTimePrekey, PeerKey,
    PrekeyBundle, RatchetMessage, SignedPrekey,
};
use crate::session::contact::{ContactDirectory, ContactRecord, TrustOrigin};
use crate::session::store::{PrekeyStoreState, StateStore, StoreError};
use crate::signaling::HandshakeInit;

/// Initial number of one-time prekeys in the pool
const INITIAL_ONE_TIME_PREKEYS: u32 = 10;
/// Pool size below which fresh one-time prekeys are generated
const ONE_TIME_REPLENISH_THRESHOLD: usize = 5;

/// Which side of the handshake this session was created on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Observable state of an established session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Established,
    /// Responder side before the initiator's first message arrived: the
    /// ratchet has no sending key material yet
    EstablishedAwaitingFirstMessage,
}

/// One cryptographic session plus its local bookkeeping
pub struct PeerSession {
    session: CryptoSession,
    role: Role,
    /// Monotonically increasing persistence version
    version: u64,
}

impl PeerSession {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn phase(&self) -> SessionPhase {
        if self.role == Role::Responder && !self.session.can_send() {
            SessionPhase::EstablishedAwaitingFirstMessage
        } else {
            SessionPhase::Established
        }
    }
}

/// The serialized-session blob: ratchet state wrapped with role and version
#[derive(Serialize, Deserialize)]
struct PeerSessionState {
    role: Role,
    version: u64,
    #[serde(with = "crate::util::serde_b64")]
    session: Vec<u8>,
}

/// Outcome of `accept_handshake`
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted { new_contact: bool },
    /// A session already existed; the redelivered init was ignored
    DuplicateIgnored,
}

pub struct SessionManager {
    identity: IdentityKeyPair,
    signed_prekey: SignedPrekey,
    one_time_prekeys: Vec<OneTimePrekey>,
    next_one_time_id: u32,
    sessions: HashMap<PeerKey, PeerSession>,
    contacts: ContactDirectory,
    store: StateStore,
}

impl SessionManager {
    /// Restore all durable state. Every stored session is deserialized here,
    /// before any signaling traffic can be processed, so inbound messages
    /// from established peers are never mistaken for new handshakes.
    pub fn restore(identity: IdentityKeyPair, store: StateStore) -> Result<Self, SessionError> {
        let (signed_prekey, one_time_prekeys, next_one_time_id) = match store.load_prekeys() {
            Some(state) => (
                SignedPrekey::from_state(&state.signed),
                state
                    .one_time
                    .iter()
                    .map(OneTimePrekey::from_state)
                    .collect(),
                state.next_one_time_id,
            ),
            None => {
                let signed = SignedPrekey::generate(1, &identity);
                let one_time: Vec<OneTimePrekey> = (1..=INITIAL_ONE_TIME_PREKEYS)
                    .map(OneTimePrekey::generate)
                    .collect();
                (signed, one_time, INITIAL_ONE_TIME_PREKEYS + 1)
            }
        };

        let mut sessions = HashMap::new();
        for (key, bytes) in store.sessions() {
            let Ok(peer) = PeerKey::from_base64(key) else {
                error!("skipping session record with invalid key {}", key);
                continue;
            };
            match peer_session_from_bytes(bytes) {
                Some(session) => {
                    sessions.insert(peer, session);
                }
                // Surfaced later as SessionMissing, distinct from an unknown
                // sender, so the UI can prompt a re-handshake
                None => error!("session record for {} is corrupt", peer),
            }
        }
        info!("restored {} sessions", sessions.len());

        let contacts = ContactDirectory::from_records(store.load_contacts());

        let mut manager = Self {
            identity,
            signed_prekey,
            one_time_prekeys,
            next_one_time_id,
            sessions,
            contacts,
            store,
        };
        manager.persist_prekeys()?;
        Ok(manager)
    }

    pub fn local_key(&self) -> PeerKey {
        self.identity.peer_key()
    }

    pub fn contacts(&self) -> &ContactDirectory {
        &self.contacts
    }

    pub fn phase(&self, peer: &PeerKey) -> Option<SessionPhase> {
        self.sessions.get(peer).map(PeerSession::phase)
    }

    pub fn role(&self, peer: &PeerKey) -> Option<Role> {
        self.sessions.get(peer).map(PeerSession::role)
    }

    /// Current prekey bundle to publish. Replenishes the one-time pool when
    /// it runs low.
    pub fn prekey_bundle(&mut self) -> PrekeyBundle {
        if self.one_time_prekeys.len() < ONE_TIME_REPLENISH_THRESHOLD {
            for _ in 0..INITIAL_ONE_TIME_PREKEYS {
                self.one_time_prekeys
                    .push(OneTimePrekey::generate(self.next_one_time_id));
                self.next_one_time_id += 1;
            }
            if let Err(e) = self.persist_prekeys() {
                error!("failed to persist replenished prekeys: {}", e);
            }
        }

        PrekeyBundle::new(
            &self.identity,
            &self.signed_prekey,
            self.one_time_prekeys.first(),
        )
    }

    /// Replace the signed prekey. Bundles published before the rotation are
    /// invalidated: handshake inits referencing the old prekey id are
    /// rejected. Existing sessions are unaffected.
    pub fn rotate_signed_prekey(&mut self) -> Result<(), SessionError> {
        let next_id = self.signed_prekey.id + 1;
        self.signed_prekey = SignedPrekey::generate(next_id, &self.identity);
        info!("rotated signed prekey to id {}", next_id);
        self.persist_prekeys()
    }

    /// Start a handshake toward the owner of `bundle`. Returns the ephemeral
    /// material that must reach the peer. Idempotent guard: a second initiate
    /// for an established peer is rejected, not overwritten.
    pub fn initiate_handshake(
        &mut self,
        bundle: &PrekeyBundle,
        display_name: &str,
        trust_origin: TrustOrigin,
    ) -> Result<HandshakeInit, SessionError> {
        let peer = bundle.identity_key;
        if self.sessions.contains_key(&peer) {
            return Err(SessionError::AlreadyEstablished(peer));
        }

        let agreement =
            x3dh::initiator_agree(&self.identity, bundle).map_err(CryptoError::from)?;
        let session =
            CryptoSession::init_initiator(agreement.shared_secret(), &bundle.prekey_public());

        let peer_session = PeerSession {
            session,
            role: Role::Initiator,
            version: 1,
        };
        self.persist_session(&peer, &peer_session)?;
        self.sessions.insert(peer, peer_session);

        if self
            .contacts
            .add_if_absent(ContactRecord::new(peer, display_name, trust_origin))
        {
            self.persist_contacts()?;
        }

        info!("handshake initiated with {}", peer);

        Ok(HandshakeInit {
            identity_key: self.local_key(),
            ephemeral_key: agreement.ephemeral_public.to_bytes(),
            prekey_id: bundle.prekey_id,
            one_time_prekey_id: agreement.used_one_time_prekey_id,
        })
    }

    /// Accept an inbound handshake-init. Redelivery of the same init for an
    /// already-established peer is ignored and logged, never reprocessed.
    pub fn accept_handshake(
        &mut self,
        sender: PeerKey,
        init: &HandshakeInit,
    ) -> Result<HandshakeOutcome, SessionError> {
        if init.identity_key != sender {
            return Err(SessionError::SenderMismatch);
        }

        if self.sessions.contains_key(&sender) {
            info!("duplicate handshake from {} ignored", sender);
            return Ok(HandshakeOutcome::DuplicateIgnored);
        }

        if init.prekey_id != self.signed_prekey.id {
            return Err(SessionError::UnknownPrekey(init.prekey_id));
        }

        let one_time = match init.one_time_prekey_id {
            Some(id) => {
                let Some(key) = self.one_time_prekeys.iter().find(|k| k.id == id).cloned()
                else {
                    return Err(SessionError::UnknownPrekey(id));
                };
                Some(key)
            }
            None => None,
        };

        let agreement = x3dh::responder_agree(
            &self.identity,
            &self.signed_prekey,
            one_time.as_ref(),
            &sender.public_key(),
            &X25519PublicKey::from(init.ephemeral_key),
        )
        .map_err(CryptoError::from)?;

        let session =
            CryptoSession::init_responder(agreement.shared_secret(), self.signed_prekey.private_key());

        // The referenced one-time prekey is consumed exactly once
        if let Some(id) = init.one_time_prekey_id {
            self.one_time_prekeys.retain(|k| k.id != id);
            self.persist_prekeys()?;
        }

        let peer_session = PeerSession {
            session,
            role: Role::Responder,
            version: 1,
        };
        self.persist_session(&sender, &peer_session)?;
        self.sessions.insert(sender, peer_session);

        let new_contact = self.contacts.add_if_absent(ContactRecord::new(
            sender,
            &sender.to_base64(),
            TrustOrigin::SharedLink,
        ));
        if new_contact {
            self.persist_contacts()?;
        }

        info!("handshake accepted from {}", sender);
        Ok(HandshakeOutcome::Accepted { new_contact })
    }

    /// Encrypt for a peer. The new ratchet state is persisted before the
    /// ciphertext is returned.
    pub fn encrypt_for(
        &mut self,
        peer: &PeerKey,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, SessionError> {
        let Some(peer_session) = self.sessions.get_mut(peer) else {
            return Err(no_session_error(&self.contacts, peer));
        };

        if !peer_session.session.can_send() {
            return Err(SessionError::RoleOrderingViolation);
        }

        let message = peer_session.session.encrypt(plaintext)?;
        peer_session.version += 1;

        let state = session_state(peer_session);
        self.store.save_session(peer, state)?;

        Ok(message)
    }

    /// Decrypt from a peer. Fails distinctly for unknown senders versus known
    /// contacts whose session is gone. The persisted state is the source of
    /// truth: a successful decrypt is written out before returning, a failed
    /// one rolls the in-memory session back to the persisted copy.
    pub fn decrypt_from(
        &mut self,
        peer: &PeerKey,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, SessionError> {
        if !self.sessions.contains_key(peer) {
            return Err(no_session_error(&self.contacts, peer));
        }

        let result = self
            .sessions
            .get_mut(peer)
            .expect("checked above")
            .session
            .decrypt(message);

        match result {
            Ok(plaintext) => {
                let peer_session = self.sessions.get_mut(peer).expect("checked above");
                peer_session.version += 1;
                let state = session_state(peer_session);
                self.store.save_session(peer, state)?;
                Ok(plaintext)
            }
            Err(e) => {
                // decrypt may have advanced the ratchet before the tag check
                // failed; discard that half-step
                let persisted = self.store.sessions().get(&peer.to_base64()).cloned();
                if let Some(rolled_back) = persisted.as_deref().and_then(peer_session_from_bytes) {
                    self.sessions.insert(*peer, rolled_back);
                }
                Err(e.into())
            }
        }
    }

    /// Explicit removal: deletes the session and contact record, unlocking a
    /// future re-handshake with the same key.
    pub fn remove_peer(&mut self, peer: &PeerKey) -> Result<(), SessionError> {
        let had_session = self.sessions.remove(peer).is_some();
        let had_contact = self.contacts.remove(peer).is_some();
        if had_session {
            self.store.remove_session(peer)?;
        }
        if had_contact {
            self.persist_contacts()?;
        }
        if !had_session && !had_contact {
            warn!("remove_peer for unknown peer {}", peer);
        }
        Ok(())
    }

    /// Write out every session. Store writes are synchronous throughout, so
    /// this is a no-op safety net for shutdown.
    pub fn persist_all(&mut self) -> Result<(), SessionError> {
        let states: Vec<(PeerKey, Vec<u8>)> = self
            .sessions
            .iter()
            .map(|(peer, s)| (*peer, session_state(s)))
            .collect();
        for (peer, state) in states {
            self.store.save_session(&peer, state)?;
        }
        self.persist_contacts()?;
        self.persist_prekeys()?;
        Ok(())
    }

    fn persist_session(
        &mut self,
        peer: &PeerKey,
        peer_session: &PeerSession,
    ) -> Result<(), SessionError> {
        self.store
            .save_session(peer, session_state(peer_session))?;
        Ok(())
    }

    fn persist_contacts(&self) -> Result<(), SessionError> {
        self.store.save_contacts(self.contacts.records())?;
        Ok(())
    }

    fn persist_prekeys(&self) -> Result<(), SessionError> {
        self.store.save_prekeys(&PrekeyStoreState {
            signed: self.signed_prekey.to_state(),
            one_time: self
                .one_time_prekeys
                .iter()
                .map(OneTimePrekey::to_state)
                .collect(),
            next_one_time_id: self.next_one_time_id,
        })?;
        Ok(())
    }
}

fn peer_session_from_bytes(bytes: &[u8]) -> Option<PeerSession> {
    let state = serde_json::from_slice::<PeerSessionState>(bytes).ok()?;
    let session = CryptoSession::deserialize(&state.session).ok()?;
    Some(PeerSession {
        session,
        role: state.role,
        version: state.version,
    })
}

fn session_state(peer_session: &PeerSession) -> Vec<u8> {
    serde_json::to_vec(&PeerSessionState {
        role: peer_session.role,
        version: peer_session.version,
        session: peer_session.session.serialize(),
    })
    .unwrap_or_default()
}

fn no_session_error(contacts: &ContactDirectory, peer: &PeerKey) -> SessionError {
    if contacts.contains(peer) {
        SessionError::SessionMissing(*peer)
    } else {
        SessionError::UnknownPeer(*peer)
    }
}

/// Session manager errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A session with {0} already exists")]
    AlreadyEstablished(PeerKey),
    #[error("No session and no contact record for {0}")]
    UnknownPeer(PeerKey),
    #[error("Contact {0} is known but its session is missing")]
    SessionMissing(PeerKey),
    #[error("Responder has no sending key material before the initiator's first message")]
    RoleOrderingViolation,
    #[error("Handshake init does not match its sender")]
    SenderMismatch,
    #[error("Handshake referenced unknown prekey {0}")]
    UnknownPrekey(u32),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
