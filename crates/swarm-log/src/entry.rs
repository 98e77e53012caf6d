//! Log entry definition and builder.
//!
//! Each entry in the operation log contains:
//! - A content hash computed from its contents
//! - Links to the entries it causally follows (its predecessors)
//! - The logical operation it carries
//! - A Lamport clock
//! - The author identity and a signature over the hash

use crate::hash::{hex_bytes, Hash, Hasher};
use crate::identity::{Author, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// The logical operation carried by an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum Op {
    /// Set `key` to `value`.
    Put { key: String, value: Value },

    /// Remove `key`.
    Delete { key: String },
}

impl Op {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        Op::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    /// The key this operation targets.
    pub fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }

    /// The value written, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Op::Put { value, .. } => Some(value),
            Op::Delete { .. } => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete { .. })
    }

    fn type_byte(&self) -> u8 {
        match self {
            Op::Put { .. } => 1,
            Op::Delete { .. } => 2,
        }
    }
}

/// Why an entry failed integrity checks.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EntryFault {
    #[error("hash does not match contents")]
    HashMismatch,

    #[error("author id does not match public key")]
    InconsistentAuthor,

    #[error("signature does not verify")]
    BadSignature,

    #[error("entry lists itself as a predecessor")]
    SelfReference,

    #[error("duplicate predecessor {0}")]
    DuplicatePredecessor(Hash),

    #[error("clock {clock} is not after predecessor clock {parent_clock}")]
    ClockRegression { clock: u64, parent_clock: u64 },
}

/// An immutable record in the operation log.
///
/// The hash is computed from the entry's contents, so any change to the
/// payload, links, clock or author changes the hash and breaks the signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// SHA-256 of the entry contents.
    pub hash: Hash,

    /// The operation this entry carries.
    pub payload: Op,

    /// Hashes of the entries this one causally follows.
    /// Empty for the first entry of a log.
    pub next: Vec<Hash>,

    /// Lamport clock: one more than the largest predecessor clock.
    pub clock: u64,

    /// Originating node.
    pub author: Author,

    /// ed25519 signature over `hash`.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Entry {
    /// Whether this entry has no predecessors.
    pub fn is_root(&self) -> bool {
        self.next.is_empty()
    }

    /// Check if `hash` is a direct predecessor of this entry.
    pub fn follows(&self, hash: &Hash) -> bool {
        self.next.contains(hash)
    }

    /// The key this entry writes.
    pub fn key(&self) -> &str {
        self.payload.key()
    }

    /// Compute the hash for an entry with the given contents.
    fn compute_hash(next: &[Hash], payload: &Op, clock: u64, author: &Author) -> Hash {
        let mut hasher = Hasher::new();

        hasher.update(&(next.len() as u64).to_le_bytes());

        // Sorted so that predecessor order does not change identity
        let mut sorted = next.to_vec();
        sorted.sort();
        for parent in &sorted {
            hasher.update(parent.as_bytes());
        }

        hasher.update(&[payload.type_byte()]);
        hasher.field(payload.key().as_bytes());
        if let Some(value) = payload.value() {
            hasher.field(value.to_string().as_bytes());
        }

        hasher.update(&clock.to_le_bytes());
        hasher.update(&author.public_key);

        hasher.finalize()
    }

    /// Run every integrity check on this entry.
    pub fn validate(&self) -> Result<(), EntryFault> {
        let computed = Self::compute_hash(&self.next, &self.payload, self.clock, &self.author);
        if computed != self.hash {
            return Err(EntryFault::HashMismatch);
        }
        if !self.author.is_consistent() {
            return Err(EntryFault::InconsistentAuthor);
        }
        if !self.author.verify(&self.hash, &self.signature) {
            return Err(EntryFault::BadSignature);
        }
        if self.next.contains(&self.hash) {
            return Err(EntryFault::SelfReference);
        }
        let mut seen = HashSet::with_capacity(self.next.len());
        for parent in &self.next {
            if !seen.insert(parent) {
                return Err(EntryFault::DuplicatePredecessor(*parent));
            }
        }
        Ok(())
    }

    /// Shorthand for `validate().is_ok()`.
    pub fn verify(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Builder for creating signed entries.
#[derive(Clone, Debug, Default)]
pub struct EntryBuilder {
    next: Vec<Hash>,
    payload: Option<Op>,
    clock: u64,
}

impl EntryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the predecessor entries.
    pub fn with_next(mut self, next: Vec<Hash>) -> Self {
        self.next = next;
        self
    }

    /// Add a single predecessor.
    pub fn with_parent(mut self, parent: Hash) -> Self {
        self.next.push(parent);
        self
    }

    pub fn with_op(mut self, op: Op) -> Self {
        self.payload = Some(op);
        self
    }

    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    /// Hash the contents and sign them with `identity`.
    pub fn sign(self, identity: &Identity) -> Entry {
        let payload = self.payload.unwrap_or_else(|| Op::delete(""));
        let author = identity.author().clone();
        let hash = Entry::compute_hash(&self.next, &payload, self.clock, &author);
        let signature = identity.stamp(&hash);

        Entry {
            hash,
            payload,
            next: self.next,
            clock: self.clock,
            author,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::from_seed([11u8; 32])
    }

    #[test]
    fn test_root_entry() {
        let entry = EntryBuilder::new()
            .with_op(Op::put("doc1", json!("A")))
            .with_clock(1)
            .sign(&identity());

        assert!(entry.is_root());
        assert_eq!(entry.key(), "doc1");
        assert!(entry.verify());
    }

    #[test]
    fn test_hash_deterministic_and_order_independent() {
        let id = identity();
        let a = EntryBuilder::new().with_op(Op::put("a", json!(1))).sign(&id);
        let b = EntryBuilder::new().with_op(Op::put("b", json!(2))).sign(&id);

        let m1 = EntryBuilder::new()
            .with_next(vec![a.hash, b.hash])
            .with_op(Op::delete("a"))
            .with_clock(2)
            .sign(&id);
        let m2 = EntryBuilder::new()
            .with_next(vec![b.hash, a.hash])
            .with_op(Op::delete("a"))
            .with_clock(2)
            .sign(&id);

        assert_eq!(m1.hash, m2.hash);
        assert!(m1.follows(&a.hash) && m1.follows(&b.hash));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let id = identity();
        let a = EntryBuilder::new().with_op(Op::put("k", json!("x"))).sign(&id);
        let b = EntryBuilder::new().with_op(Op::put("k", json!("y"))).sign(&id);
        let c = EntryBuilder::new().with_op(Op::delete("k")).sign(&id);
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut entry = EntryBuilder::new()
            .with_op(Op::put("k", json!("x")))
            .with_clock(1)
            .sign(&identity());
        entry.payload = Op::put("k", json!("evil"));
        assert_eq!(entry.validate(), Err(EntryFault::HashMismatch));
    }

    #[test]
    fn test_foreign_signature_detected() {
        let mine = EntryBuilder::new().with_op(Op::delete("k")).sign(&identity());
        let theirs = EntryBuilder::new()
            .with_op(Op::delete("k"))
            .sign(&Identity::from_seed([12u8; 32]));

        let mut forged = theirs.clone();
        forged.signature = mine.signature.clone();
        assert_eq!(forged.validate(), Err(EntryFault::BadSignature));
    }

    #[test]
    fn test_duplicate_predecessor_detected() {
        let id = identity();
        let root = EntryBuilder::new().with_op(Op::delete("k")).sign(&id);
        let entry = EntryBuilder::new()
            .with_next(vec![root.hash, root.hash])
            .with_op(Op::delete("k"))
            .with_clock(2)
            .sign(&id);
        assert_eq!(
            entry.validate(),
            Err(EntryFault::DuplicatePredecessor(root.hash))
        );
    }

    #[test]
    fn test_wire_shape() {
        let entry = EntryBuilder::new()
            .with_op(Op::put("doc1", json!({"content": "A"})))
            .with_clock(1)
            .sign(&identity());
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["payload"]["op"], "PUT");
        assert_eq!(json["payload"]["key"], "doc1");
        assert_eq!(json["hash"], entry.hash.to_hex());

        let back: Entry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
        assert!(back.verify());
    }
}
