//! Cipherlink rendezvous relay
//!
//! A WebSocket pub/sub hub for signaling envelopes. Clients subscribe to
//! topics (their inbox address plus the broadcast topic) and publish
//! envelopes into topics; the relay fans each publish out to current
//! subscribers. Zero knowledge: payloads are opaque, nothing is stored, and
//! missed envelopes are never replayed.
//!
//! Usage:
//!   cipherlink-relay [--port 8765] [--host 0.0.0.0]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use cipherlink::signaling::RelayFrame;

#[derive(Parser)]
#[command(name = "cipherlink-relay")]
#[command(about = "Rendezvous relay for cipherlink signaling")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Topic registry: subscribers per topic, addressed by client id
#[derive(Default)]
struct RelayState {
    topics: RwLock<HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>>,
}

impl RelayState {
    async fn subscribe(&self, topic: String, client: u64, tx: mpsc::UnboundedSender<String>) {
        let mut topics = self.topics.write().await;
        topics.entry(topic).or_default().insert(client, tx);
    }

    async fn unsubscribe(&self, topic: &str, client: u64) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&client);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    async fn publish(&self, topic: &str, frame: String) -> usize {
        let topics = self.topics.read().await;
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for tx in subscribers.values() {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn drop_client(&self, client: u64, subscribed: &HashSet<String>) {
        let mut topics = self.topics.write().await;
        for topic in subscribed {
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.remove(&client);
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RelayState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut subscribed: HashSet<String> = HashSet::new();

    debug!("client {} connected from {}", client_id, addr);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match RelayFrame::from_json(&text) {
                            Ok(RelayFrame::Subscribe { topic }) => {
                                subscribed.insert(topic.clone());
                                state.subscribe(topic, client_id, out_tx.clone()).await;
                            }
                            Ok(RelayFrame::Unsubscribe { topic }) => {
                                subscribed.remove(&topic);
                                state.unsubscribe(&topic, client_id).await;
                            }
                            Ok(RelayFrame::Publish { topic, envelope }) => {
                                let frame = RelayFrame::Deliver { envelope }.to_json();
                                let delivered = state.publish(&topic, frame).await;
                                debug!("client {} published to {} ({} subscribers)",
                                    client_id, topic, delivered);
                            }
                            Ok(RelayFrame::Ping) => {
                                let _ = write.send(Message::Text(RelayFrame::Pong.to_json())).await;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("invalid frame from {}: {}", addr, e);
                                let reply = RelayFrame::Error {
                                    message: "invalid frame".to_string(),
                                };
                                let _ = write.send(Message::Text(reply.to_json())).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            delivery = out_rx.recv() => {
                match delivery {
                    Some(frame) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.drop_client(client_id, &subscribed).await;
    debug!("client {} disconnected", client_id);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cipherlink_relay=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!("cipherlink relay listening on ws://{}", addr);

    let state = Arc::new(RelayState::default());

    while let Ok((stream, addr)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(handle_connection(stream, addr, state));
    }
}
