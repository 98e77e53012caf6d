//! Peer discovery.
//!
//! Three sources feed addresses to the node, which dials them through its
//! transport:
//! - the bootstrap list from configuration
//! - peer exchange, where connected peers share their peer tables
//! - an optional UDP beacon broadcast on the local network

use crate::network::{Peer, PeerId};
use crate::protocol::PeerAddr;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Peer table shared by every discovery mechanism.
pub struct Discovery {
    local_id: PeerId,
    bootstrap: Vec<String>,
    known: RwLock<HashMap<PeerId, Peer>>,
}

impl Discovery {
    pub fn new(local_id: PeerId, bootstrap: Vec<String>) -> Self {
        Self {
            local_id,
            bootstrap,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Addresses to dial at startup.
    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }

    /// Record a peer we are connected to or heard about.
    pub fn record(&self, peer: Peer) {
        if peer.id == self.local_id {
            return;
        }
        let mut known = self.known.write();
        match known.get_mut(&peer.id) {
            Some(existing) => {
                existing.touch();
                if !peer.address.is_empty() {
                    existing.address = peer.address;
                }
            }
            None => {
                known.insert(peer.id.clone(), peer);
            }
        }
    }

    /// Refresh `last_seen` for a peer we just heard from.
    pub fn seen(&self, id: &PeerId) {
        if let Some(peer) = self.known.write().get_mut(id) {
            peer.touch();
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.known.read().get(id).cloned()
    }

    /// Every peer ever recorded, sorted by id.
    pub fn known(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.known.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Our peer table in exchange form.
    pub fn exchange(&self) -> Vec<PeerAddr> {
        self.known()
            .into_iter()
            .filter(|p| !p.address.is_empty())
            .map(|p| PeerAddr {
                id: p.id.0,
                address: p.address,
            })
            .collect()
    }

    /// Merge a peer table received through exchange. Returns the addresses
    /// of peers we had not heard of before.
    pub fn merge(&self, peers: Vec<PeerAddr>) -> Vec<String> {
        let mut fresh = Vec::new();
        let mut known = self.known.write();
        for addr in peers {
            let id = PeerId::new(addr.id);
            if id == self.local_id || addr.address.is_empty() || known.contains_key(&id) {
                continue;
            }
            fresh.push(addr.address.clone());
            known.insert(id.clone(), Peer::new(id, addr.address));
        }
        fresh
    }
}

/// Announcement broadcast on the LAN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub swarm: String,
    pub id: String,
    pub address: String,
}

/// UDP beacon for local-network discovery.
///
/// Every node broadcasts its dial address on `port` and listens on the same
/// port; beacons from other nodes of the same swarm are passed on.
pub struct LanBeacon {
    pub port: u16,
    pub swarm: String,
    pub id: String,
    pub address: String,
    pub interval: Duration,
}

impl LanBeacon {
    /// Run until cancelled, sending discovered addresses to `found`.
    pub async fn run(self, found: mpsc::Sender<String>, cancel: CancellationToken) {
        let socket = match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], self.port))).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port = self.port, "LAN discovery disabled: {}", e);
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!("LAN discovery disabled: {}", e);
            return;
        }

        let beacon = Beacon {
            swarm: self.swarm.clone(),
            id: self.id.clone(),
            address: self.address.clone(),
        };
        let payload = match serde_json::to_vec(&beacon) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("LAN discovery disabled: {}", e);
                return;
            }
        };
        let target = SocketAddr::from(([255, 255, 255, 255], self.port));
        let mut ticker = tokio::time::interval(self.interval);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&payload, target).await {
                        debug!("beacon send failed: {}", e);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let Ok((len, from)) = received else { continue };
                    match serde_json::from_slice::<Beacon>(&buf[..len]) {
                        Ok(heard) if self.accepts(&heard) => {
                            debug!(peer = %heard.id, %from, "heard LAN beacon");
                            if found.send(heard.address).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!(%from, "ignoring malformed beacon: {}", e),
                    }
                }
            }
        }
    }

    /// Beacons from other nodes of our swarm.
    pub fn accepts(&self, beacon: &Beacon) -> bool {
        beacon.swarm == self.swarm && beacon.id != self.id && !beacon.address.is_empty()
    }
}
