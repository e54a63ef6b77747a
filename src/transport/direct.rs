//! Direct channel connectors
//!
//! A direct channel is a framed byte pipe negotiated out of band: the offerer
//! publishes candidate addresses over signaling, the answerer dials one. The
//! production connector is TCP with 4-byte length-prefixed frames; tests use
//! an in-process registry with the same semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::TransportError;

/// Frames above this size are dropped as hostile
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// One established direct channel, as a pair of frame queues
pub struct DirectChannel {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl DirectChannel {
    pub fn split(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.outbound, self.inbound)
    }
}

/// Dials and accepts direct channels
#[async_trait]
pub trait DirectConnector: Send + Sync + 'static {
    /// Addresses a peer can dial to reach this endpoint
    fn local_candidates(&self) -> Vec<String>;

    async fn dial(&self, candidate: &str) -> Result<DirectChannel, TransportError>;

    /// Next inbound channel; `None` once the connector is closed
    async fn accept(&self) -> Option<DirectChannel>;
}

/// TCP connector with length-prefixed framing
pub struct TcpDirectConnector {
    local_addr: String,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<DirectChannel>>,
}

impl TcpDirectConnector {
    /// Bind the listen address (port 0 picks a free port) and start
    /// accepting inbound connections.
    pub async fn bind(listen: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?
            .to_string();

        let (accept_tx, accept_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("inbound direct connection from {}", addr);
                        if accept_tx.send(spawn_channel(stream)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("direct accept error: {}", e);
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }
}

#[async_trait]
impl DirectConnector for TcpDirectConnector {
    fn local_candidates(&self) -> Vec<String> {
        vec![self.local_addr.clone()]
    }

    async fn dial(&self, candidate: &str) -> Result<DirectChannel, TransportError> {
        let stream = TcpStream::connect(candidate)
            .await
            .map_err(|e| TransportError::DialFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(spawn_channel(stream))
    }

    async fn accept(&self) -> Option<DirectChannel> {
        self.accept_rx.lock().await.recv().await
    }
}

/// Wrap a TCP stream in frame pumps feeding the channel queues
fn spawn_channel(stream: TcpStream) -> DirectChannel {
    let (mut read_half, mut write_half) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if in_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("direct channel read ended: {}", e);
                    return;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    DirectChannel {
        outbound: out_tx,
        inbound: in_rx,
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(buf)
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), TransportError> {
    writer
        .write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    writer
        .write_all(frame)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// In-process direct network for tests: endpoints register under a name and
/// dial each other by `mem:<name>` candidates
#[derive(Clone, Default)]
pub struct MemoryDirectNet {
    endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<DirectChannel>>>>,
}

impl MemoryDirectNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, name: &str) -> MemoryDirectConnector {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        self.endpoints
            .lock()
            .unwrap()
            .insert(name.to_string(), accept_tx);
        MemoryDirectConnector {
            net: self.clone(),
            name: name.to_string(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }
}

pub struct MemoryDirectConnector {
    net: MemoryDirectNet,
    name: String,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<DirectChannel>>,
}

#[async_trait]
impl DirectConnector for MemoryDirectConnector {
    fn local_candidates(&self) -> Vec<String> {
        vec![format!("mem:{}", self.name)]
    }

    async fn dial(&self, candidate: &str) -> Result<DirectChannel, TransportError> {
        let name = candidate
            .strip_prefix("mem:")
            .ok_or_else(|| TransportError::DialFailed(format!("bad candidate {}", candidate)))?;

        let accept_tx = self
            .net
            .endpoints
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::DialFailed(format!("no route to {}", name)))?;

        let (ours, theirs) = channel_pair();
        accept_tx
            .send(theirs)
            .await
            .map_err(|_| TransportError::DialFailed(format!("{} stopped accepting", name)))?;
        Ok(ours)
    }

    async fn accept(&self) -> Option<DirectChannel> {
        self.accept_rx.lock().await.recv().await
    }
}

fn channel_pair() -> (DirectChannel, DirectChannel) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        DirectChannel {
            outbound: a_tx,
            inbound: b_rx,
        },
        DirectChannel {
            outbound: b_tx,
            inbound: a_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_dial_and_frame_roundtrip() {
        let server = TcpDirectConnector::bind("127.0.0.1:0").await.unwrap();
        let client = TcpDirectConnector::bind("127.0.0.1:0").await.unwrap();

        let candidate = server.local_candidates()[0].clone();
        let dialed = client.dial(&candidate).await.unwrap();
        let accepted = server.accept().await.unwrap();

        let (dialed_tx, mut dialed_rx) = dialed.split();
        let (accepted_tx, mut accepted_rx) = accepted.split();

        dialed_tx.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(accepted_rx.recv().await.unwrap(), b"ping");

        accepted_tx.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(dialed_rx.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_tcp_channel_closes_when_peer_drops() {
        let server = TcpDirectConnector::bind("127.0.0.1:0").await.unwrap();
        let client = TcpDirectConnector::bind("127.0.0.1:0").await.unwrap();

        let candidate = server.local_candidates()[0].clone();
        let dialed = client.dial(&candidate).await.unwrap();
        let accepted = server.accept().await.unwrap();

        drop(dialed);
        let (_tx, mut rx) = accepted.split();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tcp_dial_unreachable_fails() {
        let client = TcpDirectConnector::bind("127.0.0.1:0").await.unwrap();
        // Port 1 is essentially never listening
        let result = client.dial("127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::DialFailed(_))));
    }

    #[tokio::test]
    async fn test_memory_net_roundtrip() {
        let net = MemoryDirectNet::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");

        let dialed = a.dial(&b.local_candidates()[0]).await.unwrap();
        let accepted = b.accept().await.unwrap();

        let (tx, _) = dialed.split();
        let (_, mut rx) = accepted.split();

        tx.send(vec![42]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_memory_net_unknown_endpoint() {
        let net = MemoryDirectNet::new();
        let a = net.endpoint("a");
        assert!(a.dial("mem:nowhere").await.is_err());
    }
}
