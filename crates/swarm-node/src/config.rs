//! Node configuration.

use crate::gossip::GossipConfig;
use std::net::SocketAddr;
use std::time::Duration;
use swarm_log::{Identity, OrphanConfig};

/// Default swarm name.
pub const DEFAULT_SWARM: &str = "caselaw";

/// Default control channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 50001;

/// Configuration for per-peer sync sessions.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Maximum entries per `Entries` frame.
    pub max_batch_size: usize,
    /// Rejected entries tolerated before a session is closed.
    pub reject_threshold: u32,
    /// How long a disconnected peer's buffered entries are kept.
    pub disconnect_grace: Duration,
    /// How often heads and peer tables are re-announced.
    pub announce_interval: Duration,
    /// Sent and received hashes a session remembers per direction.
    pub remembered_hashes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            reject_threshold: 16,
            disconnect_grace: Duration::from_secs(30),
            announce_interval: Duration::from_secs(10),
            remembered_hashes: 8192,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size.max(1);
        self
    }

    pub fn reject_threshold(mut self, rejects: u32) -> Self {
        self.config.reject_threshold = rejects;
        self
    }

    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.config.announce_interval = interval;
        self
    }

    pub fn remembered_hashes(mut self, count: usize) -> Self {
        self.config.remembered_hashes = count.max(1);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Shard index of this node.
    pub index: u32,
    pub swarm_name: String,
    /// Number of shards the swarm is split into.
    pub shard_count: u32,
    /// Peer transport listen address.
    pub listen_addr: SocketAddr,
    /// Local control channel address.
    pub control_addr: SocketAddr,
    /// Peers dialed at startup.
    pub bootstrap: Vec<String>,
    /// UDP port for LAN beacons. Disabled when `None`.
    pub lan_discovery_port: Option<u16>,
    /// Fixed key seed. A fresh key is generated when `None`.
    pub identity_seed: Option<[u8; 32]>,
    /// Time spent in `Joining` before serving commands.
    pub join_grace: Duration,
    /// How long `ping` waits for each peer.
    pub ping_timeout: Duration,
    pub sync: SyncConfig,
    pub orphans: OrphanConfig,
    pub gossip: GossipConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            index: 1,
            swarm_name: DEFAULT_SWARM.to_string(),
            shard_count: 8,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONTROL_PORT)),
            bootstrap: Vec::new(),
            lan_discovery_port: None,
            identity_seed: None,
            join_grace: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            sync: SyncConfig::default(),
            orphans: OrphanConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    /// Name of the collection this node replicates.
    pub fn collection_name(&self) -> String {
        format!("{}-{}-of-{}", self.swarm_name, self.index, self.shard_count)
    }

    /// The node identity: from the seed if one is set, otherwise fresh.
    pub fn identity(&self) -> Identity {
        match self.identity_seed {
            Some(seed) => Identity::from_seed(seed),
            None => Identity::generate(),
        }
    }
}

/// Builder for node configuration.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn index(mut self, index: u32) -> Self {
        self.config.index = index;
        self
    }

    pub fn swarm_name(mut self, name: impl Into<String>) -> Self {
        self.config.swarm_name = name.into();
        self
    }

    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = count;
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn control_addr(mut self, addr: SocketAddr) -> Self {
        self.config.control_addr = addr;
        self
    }

    /// Control channel on loopback at `port`.
    pub fn control_port(mut self, port: u16) -> Self {
        self.config.control_addr.set_port(port);
        self
    }

    pub fn bootstrap(mut self, peer: impl Into<String>) -> Self {
        self.config.bootstrap.push(peer.into());
        self
    }

    pub fn lan_discovery_port(mut self, port: u16) -> Self {
        self.config.lan_discovery_port = Some(port);
        self
    }

    pub fn identity_seed(mut self, seed: [u8; 32]) -> Self {
        self.config.identity_seed = Some(seed);
        self
    }

    pub fn join_grace(mut self, grace: Duration) -> Self {
        self.config.join_grace = grace;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn orphans(mut self, orphans: OrphanConfig) -> Self {
        self.config.orphans = orphans;
        self
    }

    pub fn gossip(mut self, gossip: GossipConfig) -> Self {
        self.config.gossip = gossip;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
