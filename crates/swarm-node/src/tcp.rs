//! TCP peer transport.
//!
//! Each connection carries length-prefixed JSON frames. Both sides open with
//! a `Hello` naming their id and dial address; the connection is dropped if
//! the first frame is anything else or names a peer we already hold.

use crate::network::{NetworkError, Peer, PeerId, Transport, TransportEvent, EVENT_CAPACITY};
use crate::protocol::Frame;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Frames queued per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

/// Time allowed for the peer's `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest accepted frame.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

struct Connection {
    peer: Peer,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// Distinguishes this connection from a later one to the same peer.
    generation: u64,
}

struct TcpShared {
    local_id: PeerId,
    advertised: RwLock<Option<String>>,
    connections: RwLock<HashMap<PeerId, Connection>>,
    events: mpsc::Sender<TransportEvent>,
    next_generation: Mutex<u64>,
}

/// TCP transport with a background accept loop.
pub struct TcpTransport {
    shared: Arc<TcpShared>,
    bind_addr: SocketAddr,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(local_id: PeerId, bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(TcpShared {
                local_id,
                advertised: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                events: tx,
                next_generation: Mutex::new(0),
            }),
            bind_addr,
            events: Mutex::new(Some(rx)),
            acceptor: Mutex::new(None),
        }
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec()
    }
}

impl TcpShared {
    fn advertised(&self) -> String {
        self.advertised.read().clone().unwrap_or_default()
    }

    /// Exchange `Hello`s and register the connection.
    async fn handshake(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<PeerId, NetworkError> {
        let mut framed = Framed::new(stream, TcpTransport::codec());

        let hello = Frame::Hello {
            id: self.local_id.0.clone(),
            address: self.advertised(),
        };
        send_frame(&mut framed, &hello).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("handshake with {} timed out", remote)))?;

        let (id, address) = match first {
            Some(Ok(bytes)) => match Frame::decode(&bytes) {
                Ok(Frame::Hello { id, address }) => (PeerId::new(id), address),
                Ok(other) => {
                    return Err(NetworkError::ConnectionFailed(format!(
                        "expected hello from {}, got {}",
                        remote,
                        other.kind()
                    )))
                }
                Err(e) => return Err(NetworkError::ConnectionFailed(e.to_string())),
            },
            Some(Err(e)) => return Err(NetworkError::Io(e)),
            None => return Err(NetworkError::ConnectionFailed(format!("{} closed during handshake", remote))),
        };

        if id == self.local_id {
            return Err(NetworkError::ConnectionFailed("connected to self".into()));
        }
        let address = if address.is_empty() { remote.to_string() } else { address };

        self.register(id.clone(), address, framed).await?;
        Ok(id)
    }

    /// Record the connection and queue `Connected` before the reader may
    /// forward any frame from the peer.
    async fn register(self: &Arc<Self>, id: PeerId, address: String, framed: FramedStream) -> Result<(), NetworkError> {
        let (peer, start_reading) = self.insert_connection(id, address, framed)?;

        info!(peer = %peer.id, address = %peer.address, "peer connected");
        let queued = self.events.send(TransportEvent::Connected(peer)).await;
        let _ = start_reading.send(());
        queued.map_err(|_| NetworkError::SendFailed("transport events closed".into()))
    }

    fn insert_connection(
        self: &Arc<Self>,
        id: PeerId,
        address: String,
        framed: FramedStream,
    ) -> Result<(Peer, oneshot::Sender<()>), NetworkError> {
        let mut connections = self.connections.write();
        if connections.contains_key(&id) {
            return Err(NetworkError::ConnectionFailed(format!("already connected to {}", id)));
        }

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);

        let writer_peer = id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %writer_peer, "failed to encode {} frame: {}", frame.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!(peer = %writer_peer, "write failed: {}", e);
                    break;
                }
            }
        });

        let (start_reading, gate) = oneshot::channel::<()>();
        let shared = Arc::clone(self);
        let reader_peer = id.clone();
        let reader = tokio::spawn(async move {
            if gate.await.is_ok() {
                while let Some(next) = stream.next().await {
                    let bytes = match next {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(peer = %reader_peer, "read failed: {}", e);
                            break;
                        }
                    };
                    match Frame::decode(&bytes) {
                        Ok(frame) => {
                            let event = TransportEvent::Frame {
                                from: reader_peer.clone(),
                                frame,
                            };
                            if shared.events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(peer = %reader_peer, "dropping undecodable frame: {}", e),
                    }
                }
            }
            shared.closed(&reader_peer, generation).await;
        });

        let peer = Peer::new(id.clone(), address);
        connections.insert(
            id,
            Connection {
                peer: peer.clone(),
                outbound: tx,
                reader,
                writer,
                generation,
            },
        );
        Ok((peer, start_reading))
    }

    /// Called by a reader task when its stream ends.
    async fn closed(&self, id: &PeerId, generation: u64) {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(id) {
                Some(conn) if conn.generation == generation => connections.remove(id),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.writer.abort();
            info!(peer = %id, "peer disconnected");
            let _ = self.events.send(TransportEvent::Disconnected(id.clone())).await;
        }
    }
}

async fn send_frame(framed: &mut FramedStream, frame: &Frame) -> Result<(), NetworkError> {
    let bytes = frame
        .encode()
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    framed.send(bytes).await.map_err(NetworkError::Io)
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    async fn listen(&self) -> Result<String, NetworkError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local = listener.local_addr()?;
        let advertised = if local.ip().is_unspecified() {
            SocketAddr::from(([127, 0, 0, 1], local.port())).to_string()
        } else {
            local.to_string()
        };
        *self.shared.advertised.write() = Some(advertised.clone());
        info!(address = %advertised, "listening for peers");

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = shared.handshake(stream, remote).await {
                        debug!(%remote, "inbound handshake failed: {}", e);
                    }
                });
            }
        });

        if let Some(previous) = self.acceptor.lock().replace(handle) {
            previous.abort();
        }
        Ok(advertised)
    }

    async fn connect(&self, address: &str) -> Result<PeerId, NetworkError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let remote = stream.peer_addr()?;
        self.shared.handshake(stream, remote).await
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), NetworkError> {
        let conn = self
            .shared
            .connections
            .write()
            .remove(peer)
            .ok_or_else(|| NetworkError::PeerNotFound(peer.clone()))?;

        conn.reader.abort();
        conn.writer.abort();
        info!(peer = %peer, "peer disconnected");
        let _ = self.shared.events.send(TransportEvent::Disconnected(peer.clone())).await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), NetworkError> {
        let outbound = self
            .shared
            .connections
            .read()
            .get(peer)
            .map(|c| c.outbound.clone())
            .ok_or_else(|| NetworkError::PeerNotFound(peer.clone()))?;

        outbound
            .send(frame)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    async fn broadcast(&self, frame: Frame) -> Result<usize, NetworkError> {
        let targets: Vec<mpsc::Sender<Frame>> = self
            .shared
            .connections
            .read()
            .values()
            .map(|c| c.outbound.clone())
            .collect();

        let mut reached = 0;
        for tx in targets {
            if tx.send(frame.clone()).await.is_ok() {
                reached += 1;
            }
        }
        Ok(reached)
    }

    async fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .shared
            .connections
            .read()
            .values()
            .map(|c| c.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, NetworkError> {
        self.events.lock().take().ok_or(NetworkError::AlreadySubscribed)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }
        for (_, conn) in self.shared.connections.write().drain() {
            conn.reader.abort();
            conn.writer.abort();
        }
    }
}
