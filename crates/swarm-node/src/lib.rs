//! # swarm-node
//!
//! Node runtime for shardswarm: keeps one replicated collection in sync
//! with the other nodes of a swarm and serves it over a local control
//! channel.
//!
//! ## Components
//!
//! - **Transport**: the [`Transport`] trait with an in-memory implementation
//!   for tests and a TCP implementation speaking length-delimited JSON frames
//! - **Discovery**: bootstrap peers, peer exchange and an optional LAN beacon
//! - **Sessions**: one heads-diff sync session per connected peer
//! - **Gossip**: deduplicated, TTL-limited pub/sub forwarding
//! - **Dispatch**: the JSON command protocol of the control channel
//! - **Node**: the context tying them together, with an explicit lifecycle
//!
//! ## Example
//!
//! ```rust,no_run
//! use swarm_node::{Dispatcher, MemoryHub, Node, NodeConfig};
//!
//! # async fn example() -> swarm_node::Result<()> {
//! let hub = MemoryHub::new();
//! let config = NodeConfig::builder().index(1).build();
//! let node = Node::start(config.clone(), config.identity(), hub.transport("node-1")).await?;
//! node.wait_ready().await;
//!
//! let dispatcher = Dispatcher::new(node.clone());
//! let reply = dispatcher.handle_text(r#"{"insert": {"doc1": "A"}}"#).await;
//! println!("{}", reply);
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod gossip;
pub mod network;
pub mod node;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;

pub use config::{NodeConfig, NodeConfigBuilder, SyncConfig, SyncConfigBuilder, DEFAULT_CONTROL_PORT, DEFAULT_SWARM};
pub use discovery::{Beacon, Discovery, LanBeacon};
pub use dispatch::{Command, Dispatcher, Response};
pub use error::{ErrorKind, NodeError, Result};
pub use gossip::{Gossip, GossipConfig, GossipMessage, Received};
pub use network::{create_network, MemoryHub, MemoryTransport, NetworkError, Peer, PeerId, Transport, TransportEvent};
pub use node::{Node, NodeEvent, NodeState, PeerInfo};
pub use protocol::{Frame, PeerAddr};
pub use server::ControlServer;
pub use session::{SessionState, SyncSession};
pub use tcp::TcpTransport;
