//! Frames exchanged between peers.
//!
//! Every frame is one JSON object tagged by `type`. On TCP each frame is
//! carried in a length-prefixed chunk.

use crate::gossip::GossipMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use swarm_log::{Entry, Hash};

/// Advertised peer address, as shared through peer exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub id: String,
    pub address: String,
}

/// Messages exchanged between peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake: who we are and where we can be dialed.
    Hello { id: String, address: String },

    /// Current heads of the collection log.
    Heads { collection: String, heads: Vec<Hash> },

    /// A batch of entries in causal order.
    Entries { entries: Vec<Entry> },

    /// Everything the sender planned for this session has been sent.
    SyncDone { heads: Vec<Hash> },

    /// Gossiped pub/sub message.
    Pubsub(GossipMessage),

    Ping { nonce: u64 },

    Pong { nonce: u64 },

    /// Addresses of peers the sender knows.
    PeerExchange { peers: Vec<PeerAddr> },
}

impl Frame {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Heads { .. } => "heads",
            Frame::Entries { .. } => "entries",
            Frame::SyncDone { .. } => "sync_done",
            Frame::Pubsub(_) => "pubsub",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::PeerExchange { .. } => "peer_exchange",
        }
    }

    /// Whether the frame belongs to a peer's sync session.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            Frame::Heads { .. } | Frame::Entries { .. } | Frame::SyncDone { .. }
        )
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
