//! Signaling Channel client
//!
//! Connects to the rendezvous relay, subscribes to the local inbox and the
//! broadcast address, and dispatches delivered envelopes to registered
//! handlers. Publishing is fire-and-forget: success means the relay accepted
//! the frame, not that the peer saw it.
//!
//! Missed envelopes are never replayed; the protocol layers above are built
//! to tolerate silent loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::crypto::PeerKey;
use crate::signaling::envelope::{inbox_topic, Envelope, EnvelopeBody, EnvelopeKind, BROADCAST_TOPIC};
use crate::signaling::frame::RelayFrame;
use crate::signaling::link::{SignalingConnector, SignalingLink};
use crate::signaling::SignalingError;

/// Envelope callback; invoked once per delivered envelope that matches
pub type EnvelopeHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// What a handler wants to see
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeFilter {
    Kind(EnvelopeKind),
    Any,
}

impl SubscribeFilter {
    fn matches(&self, kind: EnvelopeKind) -> bool {
        match self {
            SubscribeFilter::Kind(k) => *k == kind,
            SubscribeFilter::Any => true,
        }
    }
}

enum Command {
    Publish {
        frame: String,
        done: oneshot::Sender<Result<(), SignalingError>>,
    },
    Shutdown,
}

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    entries: Vec<(u64, SubscribeFilter, EnvelopeHandler)>,
}

/// Unsubscribe handle returned by `SignalingClient::subscribe`
pub struct Subscription {
    id: u64,
    handlers: Arc<Mutex<HandlerTable>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let mut table = self.handlers.lock().unwrap();
        table.entries.retain(|(id, _, _)| *id != self.id);
    }
}

/// Client for the pub/sub signaling relay
#[derive(Clone)]
pub struct SignalingClient {
    local_key: PeerKey,
    cmd_tx: mpsc::Sender<Command>,
    handlers: Arc<Mutex<HandlerTable>>,
    connected: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Connect and subscribe to the local inbox plus the broadcast address.
    ///
    /// Bounded retries with exponential backoff; gives up with
    /// `SignalingError::Unavailable`, which callers must treat as retryable.
    /// Calling again on an existing connection is the idempotent path: drop
    /// the old client and keep one instance per identity.
    pub async fn connect(
        connector: Arc<dyn SignalingConnector>,
        local_key: PeerKey,
        retry: RetryPolicy,
    ) -> Result<Self, SignalingError> {
        let topics = vec![inbox_topic(&local_key), BROADCAST_TOPIC.to_string()];

        let mut last_error = String::new();
        let mut link = None;
        for attempt in 0..retry.attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(retry.delay_for(attempt - 1)).await;
            }
            match connector.connect().await {
                Ok(l) => {
                    link = Some(l);
                    break;
                }
                Err(e) => {
                    debug!("signaling connect attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                }
            }
        }
        let Some(mut link) = link else {
            return Err(SignalingError::Unavailable {
                attempts: retry.attempts.max(1),
                detail: last_error,
            });
        };

        for topic in &topics {
            link.send(RelayFrame::Subscribe { topic: topic.clone() }.to_json())
                .await?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handlers = Arc::new(Mutex::new(HandlerTable::default()));
        let connected = Arc::new(AtomicBool::new(true));

        info!("signaling connected, inbox {}", topics[0]);

        tokio::spawn(run_loop(
            link,
            connector,
            topics,
            cmd_rx,
            local_key,
            handlers.clone(),
            connected.clone(),
            retry,
        ));

        Ok(Self {
            local_key,
            cmd_tx,
            handlers,
            connected,
        })
    }

    pub fn local_key(&self) -> PeerKey {
        self.local_key
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish an envelope to a peer's inbox, or to broadcast when no
    /// recipient is given. Succeeds once the relay accepted the frame.
    pub async fn publish(
        &self,
        to: Option<PeerKey>,
        body: EnvelopeBody,
    ) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let topic = match &to {
            Some(peer) => inbox_topic(peer),
            None => BROADCAST_TOPIC.to_string(),
        };
        let envelope = Envelope::new(self.local_key, to, body);
        let frame = RelayFrame::Publish { topic, envelope }.to_json();

        let (done, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { frame, done })
            .await
            .map_err(|_| SignalingError::Stopped)?;
        result.await.map_err(|_| SignalingError::Stopped)?
    }

    /// Register a handler for delivered envelopes. Multiple handlers may
    /// match one envelope; all of them run.
    pub fn subscribe(
        &self,
        filter: SubscribeFilter,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        let mut table = self.handlers.lock().unwrap();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push((id, filter, Arc::new(handler)));
        Subscription {
            id,
            handlers: self.handlers.clone(),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut link: Box<dyn SignalingLink>,
    connector: Arc<dyn SignalingConnector>,
    topics: Vec<String>,
    mut cmd_rx: mpsc::Receiver<Command>,
    local_key: PeerKey,
    handlers: Arc<Mutex<HandlerTable>>,
    connected: Arc<AtomicBool>,
    retry: RetryPolicy,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Publish { frame, done }) => {
                    let result = link.send(frame).await;
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        connected.store(false, Ordering::SeqCst);
                        match reestablish(&*connector, &topics, &mut cmd_rx, &retry).await {
                            Some(new_link) => {
                                link = new_link;
                                connected.store(true, Ordering::SeqCst);
                            }
                            None => return,
                        }
                    }
                }
                Some(Command::Shutdown) | None => return,
            },
            incoming = link.recv() => match incoming {
                Some(text) => dispatch(&mut link, local_key, &handlers, &text).await,
                None => {
                    warn!("signaling link lost, reconnecting");
                    connected.store(false, Ordering::SeqCst);
                    match reestablish(&*connector, &topics, &mut cmd_rx, &retry).await {
                        Some(new_link) => {
                            link = new_link;
                            connected.store(true, Ordering::SeqCst);
                            info!("signaling reconnected");
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Redial until a link comes back, answering publish attempts with
/// `NotConnected` in the meantime. Returns `None` on shutdown.
async fn reestablish(
    connector: &dyn SignalingConnector,
    topics: &[String],
    cmd_rx: &mut mpsc::Receiver<Command>,
    retry: &RetryPolicy,
) -> Option<Box<dyn SignalingLink>> {
    let mut attempt = 0u32;
    loop {
        let sleep = tokio::time::sleep(retry.delay_for(attempt));
        attempt = attempt.saturating_add(1);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Publish { done, .. }) => {
                        let _ = done.send(Err(SignalingError::NotConnected));
                    }
                    Some(Command::Shutdown) | None => return None,
                }
            }
        }

        match connector.connect().await {
            Ok(mut link) => {
                // Re-subscribe to the same addresses; missed envelopes are
                // not replayed
                let mut subscribed = true;
                for topic in topics {
                    if link
                        .send(RelayFrame::Subscribe { topic: topic.clone() }.to_json())
                        .await
                        .is_err()
                    {
                        subscribed = false;
                        break;
                    }
                }
                if subscribed {
                    return Some(link);
                }
            }
            Err(e) => debug!("signaling reconnect failed: {}", e),
        }
    }
}

async fn dispatch(
    link: &mut Box<dyn SignalingLink>,
    local_key: PeerKey,
    handlers: &Arc<Mutex<HandlerTable>>,
    text: &str,
) {
    match RelayFrame::from_json(text) {
        Ok(RelayFrame::Deliver { envelope }) => {
            // Self-delivery is filtered here, not at the relay
            if envelope.from == local_key {
                return;
            }
            let kind = envelope.kind();
            let matching: Vec<EnvelopeHandler> = {
                let table = handlers.lock().unwrap();
                table
                    .entries
                    .iter()
                    .filter(|(_, filter, _)| filter.matches(kind))
                    .map(|(_, _, handler)| handler.clone())
                    .collect()
            };
            for handler in matching {
                handler(&envelope);
            }
        }
        Ok(RelayFrame::Ping) => {
            let _ = link.send(RelayFrame::Pong.to_json()).await;
        }
        Ok(RelayFrame::Error { message }) => {
            warn!("relay error: {}", message);
        }
        Ok(_) => {}
        Err(e) => {
            warn!("undecodable signaling frame dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use crate::signaling::envelope::{Presence, Typing};
    use crate::signaling::link::MemoryHub;
    use async_trait::async_trait;
    use std::time::Duration;

    fn test_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    async fn connected_client(hub: &MemoryHub) -> SignalingClient {
        let key = IdentityKeyPair::generate().peer_key();
        SignalingClient::connect(Arc::new(hub.connector()), key, test_retry())
            .await
            .unwrap()
    }

    fn collecting_handler(
    ) -> (mpsc::UnboundedReceiver<Envelope>, impl Fn(&Envelope) + Send + Sync + 'static) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, move |envelope: &Envelope| {
            let _ = tx.send(envelope.clone());
        })
    }

    async fn expect_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("handler channel closed")
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "unexpected envelope delivered"
        );
    }

    #[tokio::test]
    async fn test_targeted_publish_reaches_only_recipient() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;
        let carol = connected_client(&hub).await;

        let (mut bob_rx, bob_handler) = collecting_handler();
        let _bob_sub = bob.subscribe(SubscribeFilter::Any, bob_handler);
        let (mut carol_rx, carol_handler) = collecting_handler();
        let _carol_sub = carol.subscribe(SubscribeFilter::Any, carol_handler);

        alice
            .publish(
                Some(bob.local_key()),
                EnvelopeBody::Typing(Typing { active: true }),
            )
            .await
            .unwrap();

        let envelope = expect_envelope(&mut bob_rx).await;
        assert_eq!(envelope.from, alice.local_key());
        assert_eq!(envelope.to, Some(bob.local_key()));
        expect_silence(&mut carol_rx).await;
    }

    #[tokio::test]
    async fn test_broadcast_filters_self_delivery() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;

        let (mut alice_rx, alice_handler) = collecting_handler();
        let _a = alice.subscribe(SubscribeFilter::Any, alice_handler);
        let (mut bob_rx, bob_handler) = collecting_handler();
        let _b = bob.subscribe(SubscribeFilter::Any, bob_handler);

        alice
            .publish(None, EnvelopeBody::Presence(Presence { online: true }))
            .await
            .unwrap();

        let envelope = expect_envelope(&mut bob_rx).await;
        assert_eq!(envelope.kind(), EnvelopeKind::Presence);
        // The sender never sees its own broadcast
        expect_silence(&mut alice_rx).await;
    }

    #[tokio::test]
    async fn test_kind_filter_and_multiple_handlers() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;

        let (mut typing_rx, typing_handler) = collecting_handler();
        let _t = bob.subscribe(SubscribeFilter::Kind(EnvelopeKind::Typing), typing_handler);
        let (mut any_rx, any_handler) = collecting_handler();
        let _a = bob.subscribe(SubscribeFilter::Any, any_handler);

        alice
            .publish(
                Some(bob.local_key()),
                EnvelopeBody::Presence(Presence { online: false }),
            )
            .await
            .unwrap();

        // The wildcard handler sees presence, the typing handler does not
        assert_eq!(expect_envelope(&mut any_rx).await.kind(), EnvelopeKind::Presence);
        expect_silence(&mut typing_rx).await;

        alice
            .publish(
                Some(bob.local_key()),
                EnvelopeBody::Typing(Typing { active: true }),
            )
            .await
            .unwrap();

        assert_eq!(expect_envelope(&mut typing_rx).await.kind(), EnvelopeKind::Typing);
        assert_eq!(expect_envelope(&mut any_rx).await.kind(), EnvelopeKind::Typing);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;

        let (mut rx, handler) = collecting_handler();
        let sub = bob.subscribe(SubscribeFilter::Any, handler);

        alice
            .publish(Some(bob.local_key()), EnvelopeBody::Typing(Typing { active: true }))
            .await
            .unwrap();
        expect_envelope(&mut rx).await;

        sub.unsubscribe();

        alice
            .publish(Some(bob.local_key()), EnvelopeBody::Typing(Typing { active: false }))
            .await
            .unwrap();
        expect_silence(&mut rx).await;
    }

    struct FailingConnector;

    #[async_trait]
    impl SignalingConnector for FailingConnector {
        async fn connect(&self) -> Result<Box<dyn SignalingLink>, SignalingError> {
            Err(SignalingError::ConnectionFailed("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_after_bounded_retries() {
        let key = IdentityKeyPair::generate().peer_key();
        let result =
            SignalingClient::connect(Arc::new(FailingConnector), key, test_retry()).await;

        match result {
            Err(SignalingError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes_after_drop() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;

        let (mut rx, handler) = collecting_handler();
        let _sub = bob.subscribe(SubscribeFilter::Any, handler);

        hub.disconnect_all();

        // Both clients redial with backoff and re-subscribe. Publishes may be
        // accepted before bob's side is resubscribed and get lost; the
        // protocol tolerates that, so the test sends until one lands.
        let mut delivered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if alice
                .publish(Some(bob.local_key()), EnvelopeBody::Typing(Typing { active: true }))
                .await
                .is_err()
            {
                continue;
            }
            if tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_ok()
            {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "no publish reached bob after reconnect");
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let hub = MemoryHub::new();
        let alice = connected_client(&hub).await;
        let bob = connected_client(&hub).await;

        alice.shutdown().await;
        // The task drains the shutdown before the publish lands
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = alice
            .publish(Some(bob.local_key()), EnvelopeBody::Typing(Typing { active: true }))
            .await;
        assert!(result.is_err());
    }
}
