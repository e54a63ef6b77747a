//! Connection seam between the signaling client and the rendezvous relay
//!
//! The client only ever sees `SignalingConnector`/`SignalingLink`; behind
//! them sit the production WebSocket connection and an in-memory hub that
//! speaks the same frame protocol for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::signaling::frame::RelayFrame;
use crate::signaling::SignalingError;

/// Dials one link to the relay; redialed by the client on reconnect
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn SignalingLink>, SignalingError>;
}

/// One live connection carrying text frames
#[async_trait]
pub trait SignalingLink: Send {
    async fn send(&mut self, frame: String) -> Result<(), SignalingError>;
    /// `None` once the link is gone
    async fn recv(&mut self) -> Option<String>;
}

/// WebSocket connector for a relay URL
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingLink>, SignalingError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(WebSocketLink { ws }))
    }
}

struct WebSocketLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalingLink for WebSocketLink {
    async fn send(&mut self, frame: String) -> Result<(), SignalingError> {
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    warn!("signaling link error: {}", e);
                    return None;
                }
                _ => continue,
            }
        }
    }
}

/// In-process relay speaking the same frame protocol, for tests
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    /// Delivery channel per live connection
    connections: HashMap<u64, mpsc::UnboundedSender<String>>,
    /// Connection ids per topic
    topics: HashMap<String, HashSet<u64>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    /// Drop every live connection, as a relay restart would
    pub fn disconnect_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.clear();
        inner.topics.clear();
    }

    fn open(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(id, tx);
        (id, rx)
    }

    fn close(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.remove(&id);
        for subscribers in inner.topics.values_mut() {
            subscribers.remove(&id);
        }
    }

    fn handle(&self, id: u64, frame: RelayFrame) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connections.contains_key(&id) {
            return Err(SignalingError::SendFailed("link closed".to_string()));
        }
        match frame {
            RelayFrame::Subscribe { topic } => {
                inner.topics.entry(topic).or_default().insert(id);
            }
            RelayFrame::Unsubscribe { topic } => {
                if let Some(subscribers) = inner.topics.get_mut(&topic) {
                    subscribers.remove(&id);
                }
            }
            RelayFrame::Publish { topic, envelope } => {
                let delivery = RelayFrame::Deliver { envelope }.to_json();
                let subscribers = inner.topics.get(&topic).cloned().unwrap_or_default();
                for subscriber in subscribers {
                    if let Some(tx) = inner.connections.get(&subscriber) {
                        let _ = tx.send(delivery.clone());
                    }
                }
            }
            RelayFrame::Ping => {
                if let Some(tx) = inner.connections.get(&id) {
                    let _ = tx.send(RelayFrame::Pong.to_json());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct MemoryConnector {
    hub: MemoryHub,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingLink>, SignalingError> {
        let (id, rx) = self.hub.open();
        Ok(Box::new(MemoryLink {
            hub: self.hub.clone(),
            id,
            rx,
        }))
    }
}

struct MemoryLink {
    hub: MemoryHub,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl SignalingLink for MemoryLink {
    async fn send(&mut self, frame: String) -> Result<(), SignalingError> {
        let parsed = RelayFrame::from_json(&frame)
            .map_err(|e| SignalingError::InvalidFrame(e.to_string()))?;
        self.hub.handle(self.id, parsed)
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.hub.close(self.id);
    }
}
