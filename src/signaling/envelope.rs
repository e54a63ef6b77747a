//! Signaling envelopes and their payload types
//!
//! The wire form is `{type, from, to?, payload, timestamp}` with a closed set
//! of type tags. Payloads are typed per tag and validated by serde at the
//! boundary; nothing downstream ever sees an unparsed payload.

use serde::{Deserialize, Serialize};

use crate::crypto::PeerKey;
use crate::util::{now_ms, serde_b64};

/// Shared broadcast address
pub const BROADCAST_TOPIC: &str = "broadcast";

/// A peer's private inbox address
pub fn inbox_topic(peer: &PeerKey) -> String {
    format!("inbox/{}", peer.to_base64())
}

/// One signaling message in flight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerKey,
    /// Absent for broadcast envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerKey>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn new(from: PeerKey, to: Option<PeerKey>, body: EnvelopeBody) -> Self {
        Self {
            from,
            to,
            timestamp: now_ms(),
            body,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }
}

/// Closed union of envelope payloads, tagged by the wire `type` field
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EnvelopeBody {
    HandshakeInit(HandshakeInit),
    TransportOffer(TransportOffer),
    TransportAnswer(TransportAnswer),
    TransportIce(TransportIce),
    RelayedCiphertext(RelayedCiphertext),
    Presence(Presence),
    Typing(Typing),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::HandshakeInit(_) => EnvelopeKind::HandshakeInit,
            EnvelopeBody::TransportOffer(_) => EnvelopeKind::TransportOffer,
            EnvelopeBody::TransportAnswer(_) => EnvelopeKind::TransportAnswer,
            EnvelopeBody::TransportIce(_) => EnvelopeKind::TransportIce,
            EnvelopeBody::RelayedCiphertext(_) => EnvelopeKind::RelayedCiphertext,
            EnvelopeBody::Presence(_) => EnvelopeKind::Presence,
            EnvelopeBody::Typing(_) => EnvelopeKind::Typing,
        }
    }
}

/// Envelope type tags, used for handler registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    HandshakeInit,
    TransportOffer,
    TransportAnswer,
    TransportIce,
    RelayedCiphertext,
    Presence,
    Typing,
}

/// Ephemeral material the initiator sends to complete a handshake
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeInit {
    /// Initiator's identity key; must match the envelope sender
    pub identity_key: PeerKey,
    #[serde(with = "serde_b64::key32")]
    pub ephemeral_key: [u8; 32],
    /// Which signed prekey of the responder was agreed against
    pub prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Direct-channel offer: candidate addresses the offerer accepts on
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportOffer {
    pub nonce: u64,
    pub candidates: Vec<String>,
}

/// Acceptance of an offer, naming the candidate that was dialed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportAnswer {
    pub nonce: u64,
    pub candidate: String,
}

/// Additional candidates surfaced while negotiation is in flight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportIce {
    pub nonce: u64,
    pub candidates: Vec<String>,
}

/// Ciphertext relayed through the signaling channel when no direct link is
/// open
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayedCiphertext {
    #[serde(with = "serde_b64")]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Typing {
    pub active: bool,
}
