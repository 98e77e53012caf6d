//! The node context.
//!
//! A [`Node`] owns everything one process runs for its collection: the
//! operation log, the transport, discovery, gossip and the per-peer sync
//! sessions. Its lifetime is explicit:
//!
//! `Init -> Joining -> Ready -> ShuttingDown -> Stopped`
//!
//! `Joining` is a grace period for discovery and the first sync rounds.
//! Commands are only served once the node is `Ready`.

use crate::config::NodeConfig;
use crate::discovery::{Discovery, LanBeacon};
use crate::error::{NodeError, Result};
use crate::gossip::{Gossip, GossipMessage, Received};
use crate::network::{Peer, PeerId, Transport, TransportEvent};
use crate::protocol::Frame;
use crate::session::{run_session, SessionHandle, SessionOutcome, SessionState, SyncSession};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use swarm_log::{Entry, EntryStore, Hash, Identity, MemoryEntryStore, Op, OpLog};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames queued for a session before the router waits.
const SESSION_CAPACITY: usize = 256;

/// Lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Init,
    Joining,
    Ready,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Init => "init",
            NodeState::Joining => "joining",
            NodeState::Ready => "ready",
            NodeState::ShuttingDown => "shutting down",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Events emitted by the node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    StateChanged(NodeState),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// A session reached `Synced`. `new_entries` counts entries applied
    /// since the previous report.
    PeerSynced { peer: PeerId, new_entries: usize },
    /// A pub/sub message from another node.
    Pubsub { origin: String, topic: String, payload: Vec<u8> },
    /// The node hit an unrecoverable error and stopped.
    Fatal(String),
}

/// A peer as reported by the `peers` command.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub session: Option<SessionState>,
}

struct NodeInner<T: Transport> {
    config: NodeConfig,
    collection: String,
    log: Arc<OpLog>,
    transport: Arc<T>,
    discovery: Discovery,
    gossip: Mutex<Gossip>,
    state: watch::Sender<NodeState>,
    sessions: RwLock<HashMap<PeerId, SessionHandle>>,
    /// Heads each peer held when its last session ended.
    last_known: RwLock<HashMap<PeerId, Vec<Hash>>>,
    /// Heads at the last `PeerSynced` report.
    watermark: Mutex<Vec<Hash>>,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal: Mutex<Option<String>>,
    address: RwLock<String>,
}

/// A running node. Cheap to clone.
pub struct Node<T: Transport> {
    inner: Arc<NodeInner<T>>,
}

impl<T: Transport> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Node<T> {
    /// Start the node: listen, dial bootstrap peers and enter `Joining`.
    /// The node becomes `Ready` after `join_grace`.
    pub async fn start(config: NodeConfig, identity: Identity, transport: T) -> Result<Self> {
        Self::start_with_store(config, identity, transport, Box::new(MemoryEntryStore::new())).await
    }

    /// [`start`](Self::start) on top of the given entry store. Whatever the
    /// store already holds is loaded before the node joins.
    pub async fn start_with_store(
        config: NodeConfig,
        identity: Identity,
        transport: T,
        store: Box<dyn EntryStore>,
    ) -> Result<Self> {
        let transport = Arc::new(transport);
        let transport_events = transport.subscribe()?;

        let collection = config.collection_name();
        let log = Arc::new(
            OpLog::builder(collection.clone(), identity)
                .store(store)
                .orphan_config(config.orphans.clone())
                .build(),
        );
        let local_id = transport.local_id().clone();
        let (state, _) = watch::channel(NodeState::Init);
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new(NodeInner {
            discovery: Discovery::new(local_id.clone(), config.bootstrap.clone()),
            gossip: Mutex::new(Gossip::new(local_id.0.clone(), config.gossip.clone())),
            watermark: Mutex::new(log.heads()),
            config,
            collection,
            log,
            transport,
            state,
            sessions: RwLock::new(HashMap::new()),
            last_known: RwLock::new(HashMap::new()),
            pings: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            address: RwLock::new(String::new()),
        });

        let address = inner.transport.listen().await?;
        *inner.address.write() = address.clone();
        inner.set_state(NodeState::Joining);
        info!(
            collection = %inner.collection,
            peer = %local_id,
            author = %inner.log.identity().author().short(),
            %address,
            "node joining"
        );

        inner.spawn(Arc::clone(&inner).route(transport_events));
        inner.spawn(Arc::clone(&inner).maintain());

        for address in inner.discovery.bootstrap().to_vec() {
            inner.spawn_dial(address);
        }

        if let Some(port) = inner.config.lan_discovery_port {
            let (found_tx, mut found_rx) = mpsc::channel::<String>(64);
            let beacon = LanBeacon {
                port,
                swarm: inner.config.swarm_name.clone(),
                id: local_id.0.clone(),
                address,
                interval: inner.config.sync.announce_interval,
            };
            inner.spawn(beacon.run(found_tx, inner.cancel.child_token()));

            let dialer = Arc::clone(&inner);
            inner.spawn(async move {
                while let Some(address) = found_rx.recv().await {
                    if !dialer.is_connected_to(&address) {
                        dialer.spawn_dial(address);
                    }
                }
            });
        }

        let joiner = Arc::clone(&inner);
        inner.spawn(async move {
            tokio::time::sleep(joiner.config.join_grace).await;
            if *joiner.state.borrow() == NodeState::Joining {
                joiner.set_state(NodeState::Ready);
                info!(collection = %joiner.collection, entries = joiner.log.len(), "node ready");
            }
        });

        Ok(Node { inner })
    }

    pub fn id(&self) -> &PeerId {
        self.inner.transport.local_id()
    }

    /// Address peers can dial us on.
    pub fn address(&self) -> String {
        self.inner.address.read().clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn log(&self) -> &Arc<OpLog> {
        &self.inner.log
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the node is `Ready`, or has stopped instead.
    pub async fn wait_ready(&self) -> NodeState {
        let mut rx = self.inner.state.subscribe();
        let result = rx
            .wait_for(|s| matches!(s, NodeState::Ready | NodeState::Stopped))
            .await
            .map(|s| *s);
        result.unwrap_or(NodeState::Stopped)
    }

    /// Wait until the node has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == NodeState::Stopped).await;
    }

    /// The error that stopped the node, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.fatal.lock().clone()
    }

    /// Fail with `NotReady` unless the node serves commands.
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            NodeState::Ready => Ok(()),
            other => Err(NodeError::NotReady(other)),
        }
    }

    /// Append a local operation.
    pub fn append(&self, op: Op) -> Result<Entry> {
        self.ensure_ready()?;
        self.inner.log.append(op).map_err(|e| {
            let err = NodeError::from(e);
            if err.is_fatal() {
                self.inner.fail(&err);
            }
            err
        })
    }

    /// Connected peers with their discovery and session details.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let connected = self.inner.transport.peers().await;
        let sessions = self.inner.sessions.read();
        connected
            .into_iter()
            .map(|peer| {
                let known = self.inner.discovery.get(&peer.id).unwrap_or_else(|| peer.clone());
                PeerInfo {
                    session: sessions.get(&peer.id).map(|h| *h.state.read()),
                    id: peer.id.0,
                    address: known.address,
                    last_seen: known.last_seen,
                }
            })
            .collect()
    }

    /// Session state with a peer, if one is running.
    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.inner.sessions.read().get(peer).map(|h| *h.state.read())
    }

    /// Round-trip time in milliseconds per connected peer, `None` for peers
    /// that did not answer within `ping_timeout`.
    pub async fn ping(&self) -> BTreeMap<String, Option<u64>> {
        let peers = self.inner.transport.peers().await;
        let pings = peers.into_iter().map(|peer| {
            let inner = Arc::clone(&self.inner);
            async move {
                let rtt = inner.ping_peer(&peer.id).await;
                (peer.id.0, rtt)
            }
        });
        futures::future::join_all(pings).await.into_iter().collect()
    }

    /// Publish a message on a topic. Returns how many peers it was sent to.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        let message = self.inner.gossip.lock().publish(topic, payload);
        debug!(%topic, id = %message.id.short(), "publishing");
        Ok(self.inner.transport.broadcast(Frame::Pubsub(message)).await?)
    }

    /// Dial a peer by address.
    pub async fn connect(&self, address: &str) -> Result<PeerId> {
        Ok(self.inner.transport.connect(address).await?)
    }

    /// Stop sessions and background tasks, flush the log and enter `Stopped`.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.state() {
            NodeState::ShuttingDown | NodeState::Stopped => return Ok(()),
            _ => inner.set_state(NodeState::ShuttingDown),
        }
        info!(collection = %inner.collection, "node shutting down");

        inner.cancel.cancel();
        let peers: Vec<PeerId> = inner.sessions.write().drain().map(|(id, _)| id).collect();
        for peer in peers {
            let _ = inner.transport.disconnect(&peer).await;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        let flushed = inner.log.flush().map_err(NodeError::from);
        inner.set_state(NodeState::Stopped);
        info!(collection = %inner.collection, "node stopped");
        flushed
    }
}

impl<T: Transport> NodeInner<T> {
    fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    fn set_state(&self, next: NodeState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = %next, "node state");
            let _ = self.events.send(NodeEvent::StateChanged(next));
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Unrecoverable local failure: flush what we can and stop.
    fn fail(&self, err: &NodeError) {
        error!(collection = %self.collection, "fatal: {}", err);
        *self.fatal.lock() = Some(err.to_string());
        if let Err(e) = self.log.flush() {
            error!("flush after fatal error failed: {}", e);
        }
        self.cancel.cancel();
        self.set_state(NodeState::Stopped);
        let _ = self.events.send(NodeEvent::Fatal(err.to_string()));
    }

    fn is_connected_to(&self, address: &str) -> bool {
        let sessions = self.sessions.read();
        self.discovery
            .known()
            .iter()
            .any(|p| p.address == address && sessions.contains_key(&p.id))
    }

    fn spawn_dial(self: &Arc<Self>, address: String) {
        let inner = Arc::clone(self);
        self.spawn(async move {
            match inner.transport.connect(&address).await {
                Ok(peer) => debug!(%peer, %address, "dialed peer"),
                Err(e) => debug!(%address, "dial failed: {}", e),
            }
        });
    }

    /// Dispatch transport events until shutdown.
    async fn route(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Connected(peer) => self.on_connected(peer).await,
                TransportEvent::Disconnected(peer) => self.on_disconnected(peer),
                TransportEvent::Frame { from, frame } => self.on_frame(from, frame).await,
            }
        }
        debug!("router stopped");
    }

    async fn on_connected(self: &Arc<Self>, peer: Peer) {
        info!(peer = %peer.id, address = %peer.address, "peer joined");
        self.discovery.record(peer.clone());

        let (frames_tx, frames_rx) = mpsc::channel(SESSION_CAPACITY);
        let state = Arc::new(RwLock::new(SessionState::Discovered));
        let cancel = self.cancel.child_token();
        let last_known = self.last_known.read().get(&peer.id).cloned().unwrap_or_default();
        let session = SyncSession::new(
            peer.id.clone(),
            self.collection.clone(),
            self.config.sync.clone(),
            last_known,
        );

        let previous = self.sessions.write().insert(
            peer.id.clone(),
            SessionHandle {
                frames: frames_tx,
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let inner = Arc::clone(self);
        let synced = Arc::clone(self);
        self.spawn(async move {
            let outcome = run_session(
                session,
                Arc::clone(&inner.log),
                Arc::clone(&inner.transport),
                frames_rx,
                state,
                cancel,
                move |peer| synced.on_synced(peer),
            )
            .await;
            inner.on_session_end(outcome).await;
        });

        let exchange = Frame::PeerExchange {
            peers: self.discovery.exchange(),
        };
        if let Err(e) = self.transport.send(&peer.id, exchange).await {
            debug!(peer = %peer.id, "peer exchange failed: {}", e);
        }
        let _ = self.events.send(NodeEvent::PeerConnected(peer.id));
    }

    fn on_disconnected(self: &Arc<Self>, peer: PeerId) {
        if let Some(handle) = self.sessions.write().remove(&peer) {
            handle.cancel.cancel();
        }
        info!(%peer, "peer left");
        let _ = self.events.send(NodeEvent::PeerDisconnected(peer.clone()));

        // Orphans from the peer are kept in case it comes back soon.
        let inner = Arc::clone(self);
        self.spawn(async move {
            tokio::time::sleep(inner.config.sync.disconnect_grace).await;
            if inner.sessions.read().contains_key(&peer) {
                return;
            }
            let dropped = inner.log.drop_orphans_from(peer.as_str());
            if !dropped.is_empty() {
                warn!(%peer, dropped = dropped.len(), "dropped entries buffered from departed peer");
            }
        });
    }

    async fn on_frame(self: &Arc<Self>, from: PeerId, frame: Frame) {
        self.discovery.seen(&from);

        if frame.is_sync() {
            let session = self.sessions.read().get(&from).map(|h| h.frames.clone());
            match session {
                Some(tx) => {
                    if tx.send(frame).await.is_err() {
                        debug!(peer = %from, "session already finished");
                    }
                }
                None => debug!(peer = %from, "no session for {} frame", frame.kind()),
            }
            return;
        }

        match frame {
            Frame::Pubsub(message) => self.on_pubsub(&from, message).await,
            Frame::Ping { nonce } => {
                if let Err(e) = self.transport.send(&from, Frame::Pong { nonce }).await {
                    debug!(peer = %from, "pong failed: {}", e);
                }
            }
            Frame::Pong { nonce } => {
                if let Some(waiter) = self.pings.lock().remove(&nonce) {
                    let _ = waiter.send(());
                }
            }
            Frame::PeerExchange { peers } => {
                for address in self.discovery.merge(peers) {
                    debug!(peer = %from, %address, "learned peer through exchange");
                    self.spawn_dial(address);
                }
            }
            other => debug!(peer = %from, "ignoring {} frame", other.kind()),
        }
    }

    async fn on_pubsub(&self, from: &PeerId, message: GossipMessage) {
        let received = self.gossip.lock().receive(&message);
        match received {
            Received::New { forward } => {
                debug!(peer = %from, topic = %message.topic, origin = %message.origin, "pubsub message");
                if let Some(forward) = forward {
                    for peer in self.transport.peers().await {
                        if &peer.id == from || peer.id.as_str() == message.origin {
                            continue;
                        }
                        let _ = self.transport.send(&peer.id, Frame::Pubsub(forward.clone())).await;
                    }
                }
                let _ = self.events.send(NodeEvent::Pubsub {
                    origin: message.origin,
                    topic: message.topic,
                    payload: message.payload,
                });
            }
            Received::Duplicate => {}
            Received::Invalid => warn!(peer = %from, "dropping pubsub message with bad id"),
        }
    }

    fn on_synced(&self, peer: &PeerId) {
        let mut watermark = self.watermark.lock();
        let fresh = self.log.entries_since(&watermark);
        for entry in &fresh {
            debug!(%peer, hash = %entry.hash.short(), key = entry.key(), "new entry since last join");
        }
        *watermark = self.log.heads();
        drop(watermark);

        let _ = self.events.send(NodeEvent::PeerSynced {
            peer: peer.clone(),
            new_entries: fresh.len(),
        });
    }

    async fn on_session_end(&self, outcome: SessionOutcome) {
        let SessionOutcome {
            peer,
            last_known,
            result,
        } = outcome;
        if !last_known.is_empty() {
            self.last_known.write().insert(peer.clone(), last_known);
        }

        match result {
            Ok(()) => debug!(%peer, "session ended"),
            Err(err) if err.is_fatal() => self.fail(&err),
            Err(err) => {
                warn!(%peer, kind = %err.kind(), "closing session: {}", err);
                let _ = self.transport.disconnect(&peer).await;
            }
        }
    }

    async fn ping_peer(&self, peer: &PeerId) -> Option<u64> {
        let nonce: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(nonce, tx);

        let start = Instant::now();
        let answered = match self.transport.send(peer, Frame::Ping { nonce }).await {
            Ok(()) => matches!(tokio::time::timeout(self.config.ping_timeout, rx).await, Ok(Ok(()))),
            Err(e) => {
                debug!(%peer, "ping failed: {}", e);
                false
            }
        };
        self.pings.lock().remove(&nonce);

        answered.then(|| start.elapsed().as_millis() as u64)
    }

    /// Periodic housekeeping: orphan expiry and peer exchange.
    async fn maintain(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sync.announce_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let expired = self.log.expire_orphans(Instant::now());
            if !expired.is_empty() {
                warn!(expired = expired.len(), "dropped orphan entries past their age budget");
            }

            let exchange = Frame::PeerExchange {
                peers: self.discovery.exchange(),
            };
            if let Err(e) = self.transport.broadcast(exchange).await {
                debug!("peer exchange broadcast failed: {}", e);
            }
        }
    }
}
