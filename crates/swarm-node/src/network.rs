//! Peer transport abstractions and the in-memory transport.

use crate::protocol::Frame;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique identifier for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A known peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Address the peer can be dialed on.
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            last_seen: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// What the transport reports to its subscriber.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected(Peer),
    Disconnected(PeerId),
    Frame { from: PeerId, frame: Frame },
}

/// Network error type.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport events already taken")]
    AlreadySubscribed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract peer transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifier this transport announces to peers.
    fn local_id(&self) -> &PeerId;

    /// Start accepting peers. Returns the address others should dial.
    async fn listen(&self) -> Result<String, NetworkError>;

    /// Dial a peer by address.
    async fn connect(&self, address: &str) -> Result<PeerId, NetworkError>;

    /// Drop the connection to a peer.
    async fn disconnect(&self, peer: &PeerId) -> Result<(), NetworkError>;

    /// Send a frame to one connected peer.
    async fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), NetworkError>;

    /// Send a frame to every connected peer. Returns how many were reached.
    async fn broadcast(&self, frame: Frame) -> Result<usize, NetworkError>;

    /// Currently connected peers.
    async fn peers(&self) -> Vec<Peer>;

    /// Take the event stream. Only one subscriber is supported.
    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, NetworkError>;
}

/// Capacity of per-transport event channels.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Registry that lets memory transports dial each other by id.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<RwLock<HashMap<PeerId, Arc<MemoryEndpoint>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport registered on this hub.
    pub fn transport(&self, id: impl Into<String>) -> MemoryTransport {
        let id = PeerId::new(id);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let endpoint = Arc::new(MemoryEndpoint {
            id: id.clone(),
            events: tx,
            links: RwLock::new(HashMap::new()),
        });
        self.endpoints.write().insert(id, endpoint.clone());

        MemoryTransport {
            hub: self.clone(),
            endpoint,
            events: Mutex::new(Some(rx)),
        }
    }

    fn endpoint(&self, id: &PeerId) -> Option<Arc<MemoryEndpoint>> {
        self.endpoints.read().get(id).cloned()
    }
}

struct MemoryEndpoint {
    id: PeerId,
    events: mpsc::Sender<TransportEvent>,
    /// Connected peers and the endpoint to deliver to.
    links: RwLock<HashMap<PeerId, (Peer, Arc<MemoryEndpoint>)>>,
}

impl MemoryEndpoint {
    /// Record a link to `other` and queue `Connected`. Waits for queue space
    /// rather than dropping the event.
    async fn link(self: &Arc<Self>, other: &Arc<MemoryEndpoint>) -> bool {
        let peer = Peer::new(other.id.clone(), other.id.0.clone());
        {
            let mut links = self.links.write();
            if links.contains_key(&other.id) {
                return false;
            }
            links.insert(other.id.clone(), (peer.clone(), other.clone()));
        }
        let _ = self.events.send(TransportEvent::Connected(peer)).await;
        true
    }

    async fn unlink(&self, other: &PeerId) {
        let removed = self.links.write().remove(other).is_some();
        if removed {
            let _ = self.events.send(TransportEvent::Disconnected(other.clone())).await;
        }
    }
}

/// In-memory transport for testing and simulation.
pub struct MemoryTransport {
    hub: MemoryHub,
    endpoint: Arc<MemoryEndpoint>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MemoryTransport {
    /// Connect two memory transports together (for testing).
    pub async fn connect_to(&self, other: &MemoryTransport) {
        if self.endpoint.link(&other.endpoint).await {
            other.endpoint.link(&self.endpoint).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.endpoint.id
    }

    async fn listen(&self) -> Result<String, NetworkError> {
        Ok(self.endpoint.id.0.clone())
    }

    async fn connect(&self, address: &str) -> Result<PeerId, NetworkError> {
        let id = PeerId::new(address);
        if id == self.endpoint.id {
            return Err(NetworkError::ConnectionFailed("refusing to dial self".into()));
        }
        let other = self
            .hub
            .endpoint(&id)
            .ok_or_else(|| NetworkError::ConnectionFailed(format!("no endpoint at {}", address)))?;

        if self.endpoint.link(&other).await {
            other.link(&self.endpoint).await;
        }
        Ok(id)
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), NetworkError> {
        let other = self
            .endpoint
            .links
            .read()
            .get(peer)
            .map(|(_, endpoint)| endpoint.clone())
            .ok_or_else(|| NetworkError::PeerNotFound(peer.clone()))?;

        self.endpoint.unlink(peer).await;
        other.unlink(&self.endpoint.id).await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), NetworkError> {
        let target = {
            let links = self.endpoint.links.read();
            links.get(peer).map(|(_, endpoint)| endpoint.clone())
        };

        let Some(target) = target else {
            return Err(NetworkError::PeerNotFound(peer.clone()));
        };
        target
            .events
            .send(TransportEvent::Frame {
                from: self.endpoint.id.clone(),
                frame,
            })
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    async fn broadcast(&self, frame: Frame) -> Result<usize, NetworkError> {
        let targets: Vec<PeerId> = self.endpoint.links.read().keys().cloned().collect();
        let mut reached = 0;
        for peer in targets {
            if self.send(&peer, frame.clone()).await.is_ok() {
                reached += 1;
            }
        }
        Ok(reached)
    }

    async fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .endpoint
            .links
            .read()
            .values()
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, NetworkError> {
        self.events.lock().take().ok_or(NetworkError::AlreadySubscribed)
    }
}

/// Create a network of connected memory transports for testing.
pub async fn create_network(count: usize) -> Vec<MemoryTransport> {
    let hub = MemoryHub::new();
    let transports: Vec<_> = (0..count)
        .map(|i| hub.transport(format!("peer-{}", i)))
        .collect();

    // Connect all peers to each other
    for i in 0..count {
        for j in (i + 1)..count {
            transports[i].connect_to(&transports[j]).await;
        }
    }

    transports
}
