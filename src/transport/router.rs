//! Transport Router: direct channel preferred, signaling relay as fallback
//!
//! Delivers already-encrypted bytes. Negotiation envelopes (offer / answer /
//! ice) travel over the Signaling Channel; the resulting direct channel is a
//! framed byte pipe bound to a peer key by a 32-byte hello frame. Inbound
//! bytes reach the session layer through one `on_ciphertext` callback no
//! matter which path they took.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::crypto::PeerKey;
use crate::signaling::{
    Envelope, EnvelopeBody, RelayedCiphertext, SignalingClient, TransportAnswer, TransportIce,
    TransportOffer,
};
use crate::transport::direct::DirectConnector;
use crate::transport::link::{LinkPhase, TransportLink};
use crate::transport::TransportError;

pub type CiphertextCallback = Arc<dyn Fn(PeerKey, Vec<u8>) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(PeerKey, LinkPhase) + Send + Sync>;

/// Router timing knobs
#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    pub negotiation_timeout: Duration,
    pub idle_timeout: Duration,
}

struct RouterInner {
    local_key: PeerKey,
    signaling: SignalingClient,
    connector: Arc<dyn DirectConnector>,
    links: Mutex<HashMap<PeerKey, TransportLink>>,
    config: RouterConfig,
    on_ciphertext: CiphertextCallback,
    on_state: StateCallback,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TransportRouter {
    inner: Arc<RouterInner>,
}

impl TransportRouter {
    pub fn new(
        local_key: PeerKey,
        signaling: SignalingClient,
        connector: Arc<dyn DirectConnector>,
        config: RouterConfig,
        on_ciphertext: CiphertextCallback,
        on_state: StateCallback,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(RouterInner {
            local_key,
            signaling,
            connector,
            links: Mutex::new(HashMap::new()),
            config,
            on_ciphertext,
            on_state,
            shutdown,
        });

        tokio::spawn(accept_loop(inner.clone(), inner.shutdown.subscribe()));
        tokio::spawn(sweep_loop(inner.clone(), inner.shutdown.subscribe()));

        Self { inner }
    }

    /// Current link phase for a peer (`Idle` when no link exists)
    pub fn phase(&self, peer: &PeerKey) -> LinkPhase {
        self.inner
            .links
            .lock()
            .unwrap()
            .get(peer)
            .map(|link| link.phase)
            .unwrap_or(LinkPhase::Idle)
    }

    /// Begin direct-channel negotiation with a peer. A no-op while a link is
    /// already open or negotiating. Timing out is not an error; the relay
    /// fallback remains usable.
    pub async fn connect(&self, peer: PeerKey) -> Result<(), TransportError> {
        let nonce = rand::random::<u64>();
        {
            let mut links = self.inner.links.lock().unwrap();
            let link = links.entry(peer).or_insert_with(|| TransportLink::new(peer));
            if matches!(link.phase, LinkPhase::Open | LinkPhase::Negotiating) {
                return Ok(());
            }
            link.phase = LinkPhase::Negotiating;
            link.offer_nonce = Some(nonce);
            link.touch();
        }
        (self.inner.on_state)(peer, LinkPhase::Negotiating);

        let offer = TransportOffer {
            nonce,
            candidates: self.inner.connector.local_candidates(),
        };
        if let Err(e) = self
            .inner
            .signaling
            .publish(Some(peer), EnvelopeBody::TransportOffer(offer))
            .await
        {
            set_phase(&self.inner, peer, LinkPhase::Closed);
            return Err(e.into());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.negotiation_timeout).await;
            let timed_out = {
                let mut links = inner.links.lock().unwrap();
                match links.get_mut(&peer) {
                    Some(link)
                        if link.phase == LinkPhase::Negotiating
                            && link.offer_nonce == Some(nonce) =>
                    {
                        link.phase = LinkPhase::Closed;
                        link.offer_nonce = None;
                        true
                    }
                    _ => false,
                }
            };
            if timed_out {
                debug!("direct negotiation with {} timed out, relay remains", peer);
                (inner.on_state)(peer, LinkPhase::Closed);
            }
        });

        Ok(())
    }

    /// Deliver bytes to a peer: directly when the link is open, otherwise as
    /// a relayed-ciphertext envelope. Success on the relay path means the
    /// publish was accepted.
    pub async fn send(&self, peer: PeerKey, bytes: Vec<u8>) -> Result<(), TransportError> {
        let direct = {
            let links = self.inner.links.lock().unwrap();
            links
                .get(&peer)
                .filter(|link| link.phase == LinkPhase::Open)
                .and_then(|link| link.outbound.clone())
        };

        if let Some(tx) = direct {
            if tx.send(bytes.clone()).await.is_ok() {
                let mut links = self.inner.links.lock().unwrap();
                if let Some(link) = links.get_mut(&peer) {
                    link.touch();
                }
                return Ok(());
            }
            // channel died underneath us
            set_phase(&self.inner, peer, LinkPhase::Closed);
        }

        self.inner
            .signaling
            .publish(
                Some(peer),
                EnvelopeBody::RelayedCiphertext(RelayedCiphertext { data: bytes }),
            )
            .await?;
        Ok(())
    }

    /// Route one signaling envelope. Non-transport envelopes are ignored.
    pub async fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.body {
            EnvelopeBody::TransportOffer(offer) => self.handle_offer(envelope.from, offer).await,
            EnvelopeBody::TransportAnswer(answer) => self.handle_answer(envelope.from, answer),
            EnvelopeBody::TransportIce(ice) => self.handle_ice(envelope.from, ice).await,
            EnvelopeBody::RelayedCiphertext(relayed) => {
                (self.inner.on_ciphertext)(envelope.from, relayed.data.clone());
            }
            _ => {}
        }
    }

    async fn handle_offer(&self, from: PeerKey, offer: &TransportOffer) {
        let mut negotiating_changed = false;
        {
            let mut links = self.inner.links.lock().unwrap();
            let link = links.entry(from).or_insert_with(|| TransportLink::new(from));

            // Glare: both sides offered. The lexicographically smaller key's
            // offer wins; the larger key discards its own and answers.
            if link.phase == LinkPhase::Negotiating && link.offer_nonce.is_some() {
                if self.inner.local_key < from {
                    debug!("offer glare with {}: our offer wins", from);
                    return;
                }
                debug!("offer glare with {}: yielding to their offer", from);
                link.offer_nonce = None;
            }

            if link.phase != LinkPhase::Negotiating {
                link.phase = LinkPhase::Negotiating;
                negotiating_changed = true;
            }
            link.touch();
        }
        if negotiating_changed {
            (self.inner.on_state)(from, LinkPhase::Negotiating);
        }

        self.try_candidates(from, offer.nonce, &offer.candidates)
            .await;
    }

    fn handle_answer(&self, from: PeerKey, answer: &TransportAnswer) {
        let mut links = self.inner.links.lock().unwrap();
        match links.get_mut(&from) {
            Some(link) if link.offer_nonce == Some(answer.nonce) => {
                // the channel itself arrives through the acceptor; the answer
                // only confirms the peer is dialing
                debug!("transport answer from {} for candidate {}", from, answer.candidate);
                link.touch();
            }
            _ => debug!("stale transport answer from {}", from),
        }
    }

    async fn handle_ice(&self, from: PeerKey, ice: &TransportIce) {
        let should_dial = {
            let links = self.inner.links.lock().unwrap();
            links
                .get(&from)
                .map(|link| link.phase == LinkPhase::Negotiating && link.offer_nonce.is_none())
                .unwrap_or(false)
        };
        if should_dial {
            self.try_candidates(from, ice.nonce, &ice.candidates).await;
        }
    }

    /// Answerer side: dial offered candidates in order, bind the first that
    /// connects, and confirm with a transport-answer.
    async fn try_candidates(&self, from: PeerKey, nonce: u64, candidates: &[String]) {
        for candidate in candidates {
            match self.inner.connector.dial(candidate).await {
                Ok(channel) => {
                    let (out_tx, in_rx) = channel.split();
                    // hello binds this connection to our key on the far side
                    if out_tx
                        .send(self.inner.local_key.as_bytes().to_vec())
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    bind_channel(&self.inner, from, out_tx, in_rx);

                    let answer = TransportAnswer {
                        nonce,
                        candidate: candidate.clone(),
                    };
                    if let Err(e) = self
                        .inner
                        .signaling
                        .publish(Some(from), EnvelopeBody::TransportAnswer(answer))
                        .await
                    {
                        warn!("transport answer publish failed: {}", e);
                    }
                    return;
                }
                Err(e) => debug!("candidate {} unreachable: {}", candidate, e),
            }
        }
        warn!("no offered candidate for {} was reachable", from);
        set_phase(&self.inner, from, LinkPhase::Closed);
    }

    /// Tear down the direct link; the relay fallback keeps working.
    pub fn disconnect(&self, peer: &PeerKey) {
        let changed = {
            let mut links = self.inner.links.lock().unwrap();
            match links.get_mut(peer) {
                Some(link) if link.phase != LinkPhase::Closed => {
                    link.phase = LinkPhase::Closed;
                    link.outbound = None;
                    link.offer_nonce = None;
                    link.epoch += 1;
                    true
                }
                _ => false,
            }
        };
        if changed {
            (self.inner.on_state)(*peer, LinkPhase::Closed);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

/// Accept inbound channels, bind each to the peer named in its hello frame
async fn accept_loop(inner: Arc<RouterInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = inner.connector.accept() => accepted,
        };
        let Some(channel) = accepted else { return };

        let (out_tx, mut in_rx) = channel.split();
        let hello = tokio::time::timeout(inner.config.negotiation_timeout, in_rx.recv()).await;
        match hello {
            Ok(Some(frame)) if frame.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&frame);
                let peer = PeerKey::from_bytes(key);
                info!("direct channel accepted from {}", peer);
                bind_channel(&inner, peer, out_tx, in_rx);
            }
            _ => warn!("inbound direct channel sent no hello, dropping"),
        }
    }
}

/// Install a freshly connected channel as the peer's link, superseding any
/// previous one, and pump its inbound frames into `on_ciphertext`
fn bind_channel(
    inner: &Arc<RouterInner>,
    peer: PeerKey,
    out_tx: mpsc::Sender<Vec<u8>>,
    mut in_rx: mpsc::Receiver<Vec<u8>>,
) {
    let epoch = {
        let mut links = inner.links.lock().unwrap();
        let link = links.entry(peer).or_insert_with(|| TransportLink::new(peer));
        link.epoch += 1;
        link.outbound = Some(out_tx);
        link.offer_nonce = None;
        link.phase = LinkPhase::Open;
        link.touch();
        link.epoch
    };
    (inner.on_state)(peer, LinkPhase::Open);

    let inner = inner.clone();
    let mut shutdown = inner.shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => return,
                frame = in_rx.recv() => frame,
            };
            match frame {
                Some(bytes) => {
                    {
                        let mut links = inner.links.lock().unwrap();
                        if let Some(link) = links.get_mut(&peer) {
                            link.touch();
                        }
                    }
                    (inner.on_ciphertext)(peer, bytes);
                }
                None => {
                    let closed = {
                        let mut links = inner.links.lock().unwrap();
                        match links.get_mut(&peer) {
                            // only this channel may close the link; a
                            // superseding channel bumped the epoch already
                            Some(link) if link.epoch == epoch && link.phase == LinkPhase::Open => {
                                link.phase = LinkPhase::Closed;
                                link.outbound = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    if closed {
                        (inner.on_state)(peer, LinkPhase::Closed);
                    }
                    return;
                }
            }
        }
    });
}

/// Close links that have been inactive past the idle window
async fn sweep_loop(inner: Arc<RouterInner>, mut shutdown: watch::Receiver<bool>) {
    let period = (inner.config.idle_timeout / 4).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let idle: Vec<PeerKey> = {
            let mut links = inner.links.lock().unwrap();
            let mut idle = Vec::new();
            for link in links.values_mut() {
                if link.phase == LinkPhase::Open
                    && link.last_activity.elapsed() > inner.config.idle_timeout
                {
                    link.phase = LinkPhase::Closed;
                    link.outbound = None;
                    link.epoch += 1;
                    idle.push(link.peer);
                }
            }
            idle
        };
        for peer in idle {
            debug!("closing idle direct link to {}", peer);
            (inner.on_state)(peer, LinkPhase::Closed);
        }
    }
}

fn set_phase(inner: &Arc<RouterInner>, peer: PeerKey, phase: LinkPhase) {
    let changed = {
        let mut links = inner.links.lock().unwrap();
        let link = links.entry(peer).or_insert_with(|| TransportLink::new(peer));
        if link.phase == phase {
            false
        } else {
            link.phase = phase;
            if phase != LinkPhase::Open {
                link.outbound = None;
                link.offer_nonce = None;
            }
            true
        }
    };
    if changed {
        (inner.on_state)(peer, phase);
    }
}
