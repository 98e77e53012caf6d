//! Gossip dissemination for pub/sub messages.
//!
//! Each message carries a content-derived id. A node delivers and forwards a
//! message the first time it sees the id and drops it afterwards. Forwarding
//! stops once the hop budget is spent.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use swarm_log::{Hash, Hasher};

/// Configuration for gossip.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Maximum message ids remembered for deduplication.
    pub seen_capacity: usize,

    /// Time-to-live: maximum hops a message can travel.
    pub ttl: u8,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            seen_capacity: 4096,
            ttl: 6,
        }
    }
}

/// A published message travelling through the swarm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Unique message ID (hash of contents).
    pub id: Hash,

    /// The node that published this message.
    pub origin: String,

    pub topic: String,

    pub payload: Vec<u8>,

    /// Per-origin sequence number.
    pub seq: u64,

    /// Remaining hops.
    pub ttl: u8,
}

impl GossipMessage {
    pub fn new(origin: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>, seq: u64, ttl: u8) -> Self {
        let origin = origin.into();
        let topic = topic.into();
        let id = Self::compute_id(&origin, &topic, &payload, seq);

        GossipMessage {
            id,
            origin,
            topic,
            payload,
            seq,
            ttl,
        }
    }

    fn compute_id(origin: &str, topic: &str, payload: &[u8], seq: u64) -> Hash {
        let mut hasher = Hasher::new();
        for part in [origin.as_bytes(), topic.as_bytes(), payload] {
            hasher.field(part);
        }
        hasher.update(&seq.to_le_bytes());
        hasher.finalize()
    }

    /// Whether the id matches the contents.
    pub fn is_authentic(&self) -> bool {
        Self::compute_id(&self.origin, &self.topic, &self.payload, self.seq) == self.id
    }

    /// Create a forwarded copy with decremented TTL.
    pub fn forward(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }

        Some(GossipMessage {
            ttl: self.ttl - 1,
            ..self.clone()
        })
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Outcome of receiving a gossip message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// First sighting. `forward` is the copy to pass on, if any hops remain.
    New { forward: Option<GossipMessage> },
    Duplicate,
    /// Id does not match the contents.
    Invalid,
}

/// Deduplicating gossip state for one node.
pub struct Gossip {
    local_id: String,
    config: GossipConfig,

    /// Sequence number of the last message we published.
    seq: u64,

    /// Message IDs we've seen (for deduplication).
    seen: HashSet<Hash>,

    /// Order of seen messages (for LRU eviction).
    seen_order: VecDeque<Hash>,
}

impl Gossip {
    pub fn new(local_id: impl Into<String>, config: GossipConfig) -> Self {
        Gossip {
            local_id: local_id.into(),
            config,
            seq: 0,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Create a new message from this node.
    pub fn publish(&mut self, topic: impl Into<String>, payload: Vec<u8>) -> GossipMessage {
        self.seq += 1;
        let message = GossipMessage::new(&self.local_id, topic, payload, self.seq, self.config.ttl);
        self.mark_seen(message.id);
        message
    }

    /// Handle a message received from a peer.
    pub fn receive(&mut self, message: &GossipMessage) -> Received {
        if !message.is_authentic() {
            return Received::Invalid;
        }
        if !self.mark_seen(message.id) {
            return Received::Duplicate;
        }
        Received::New {
            forward: message.forward(),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Mark a message as seen. Returns false if it already was.
    fn mark_seen(&mut self, id: Hash) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);

        // Evict old entries if buffer is full
        while self.seen_order.len() > self.config.seen_capacity {
            if let Some(old_id) = self.seen_order.pop_front() {
                self.seen.remove(&old_id);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_assigns_sequence() {
        let mut gossip = Gossip::new("a", GossipConfig::default());
        let first = gossip.publish("news", b"hello".to_vec());
        let second = gossip.publish("news", b"hello".to_vec());

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_ne!(first.id, second.id);
        assert!(first.is_authentic());
    }

    #[test]
    fn test_receive_deduplicates() {
        let mut a = Gossip::new("a", GossipConfig::default());
        let mut b = Gossip::new("b", GossipConfig::default());
        let message = a.publish("news", b"hello".to_vec());

        match b.receive(&message) {
            Received::New { forward: Some(fwd) } => assert_eq!(fwd.ttl, message.ttl - 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(b.receive(&message), Received::Duplicate);

        // Our own message echoed back is a duplicate too.
        assert_eq!(a.receive(&message), Received::Duplicate);
    }

    #[test]
    fn test_ttl_exhausted() {
        let mut gossip = Gossip::new("b", GossipConfig::default());
        let message = GossipMessage::new("a", "t", vec![1], 1, 0);
        assert_eq!(gossip.receive(&message), Received::New { forward: None });
    }

    #[test]
    fn test_tampered_message_invalid() {
        let mut gossip = Gossip::new("b", GossipConfig::default());
        let mut message = GossipMessage::new("a", "t", b"x".to_vec(), 1, 3);
        message.payload = b"y".to_vec();
        assert_eq!(gossip.receive(&message), Received::Invalid);
    }

    #[test]
    fn test_seen_capacity() {
        let config = GossipConfig {
            seen_capacity: 2,
            ..Default::default()
        };
        let mut gossip = Gossip::new("b", config);
        let messages: Vec<_> = (1..=3).map(|i| GossipMessage::new("a", "t", vec![], i, 3)).collect();
        for m in &messages {
            gossip.receive(m);
        }

        assert_eq!(gossip.seen_count(), 2);
        // The oldest id was evicted, so it reads as new again.
        assert!(matches!(gossip.receive(&messages[0]), Received::New { .. }));
    }
}
