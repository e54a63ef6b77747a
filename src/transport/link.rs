//! Per-peer direct-channel state

use std::time::Instant;

use tokio::sync::mpsc;

use crate::crypto::PeerKey;

/// Direct-channel lifecycle. `Closed` is not an error state: the relay
/// fallback stays usable throughout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Negotiating,
    Open,
    Closed,
}

/// State for one peer's direct channel
pub(crate) struct TransportLink {
    pub peer: PeerKey,
    pub phase: LinkPhase,
    pub last_activity: Instant,
    /// Outbound frame queue of the currently bound channel
    pub outbound: Option<mpsc::Sender<Vec<u8>>>,
    /// Nonce of our own outstanding offer, if we are the offerer
    pub offer_nonce: Option<u64>,
    /// Bumped whenever a fresh channel supersedes the previous one, so a
    /// stale channel's teardown cannot close its successor
    pub epoch: u64,
}

impl TransportLink {
    pub fn new(peer: PeerKey) -> Self {
        Self {
            peer,
            phase: LinkPhase::Idle,
            last_activity: Instant::now(),
            outbound: None,
            offer_nonce: None,
            epoch: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
