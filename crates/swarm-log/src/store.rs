//! Entry storage trait and the in-memory implementation.
//!
//! The EntryStore holds applied entries only, indexed by hash, and tracks
//! heads (entries without a known successor) automatically.

use crate::entry::{Entry, EntryFault};
use crate::hash::Hash;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Entry failed integrity checks.
    #[error("verification failed for {}: {}", .0.short(), .1)]
    VerificationFailed(Hash, EntryFault),

    /// Predecessors are not in the store yet.
    #[error("missing predecessors: {:?}", .0.iter().map(|h| h.short()).collect::<Vec<_>>())]
    MissingParents(Vec<Hash>),

    /// The persistence backend failed. Not recoverable.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Trait for content-addressed entry storage.
///
/// Only entries whose predecessors are all present may be stored, so the
/// contents of a store are always causally closed.
pub trait EntryStore: Send {
    /// Get an entry by hash.
    fn get(&self, hash: &Hash) -> Option<&Entry>;

    /// Store an entry, returning its hash.
    ///
    /// The entry is verified before anything else, including the
    /// predecessor check, so `MissingParents` implies a well-formed entry.
    /// Storing an entry that is already present is a no-op.
    fn put(&mut self, entry: Entry) -> Result<Hash, StoreError>;

    /// Current heads, sorted.
    fn heads(&self) -> Vec<Hash>;

    fn contains(&self, hash: &Hash) -> bool;

    /// Immediate successors of an entry.
    fn children(&self, hash: &Hash) -> Vec<Hash>;

    /// All entries in topological order (predecessors before successors),
    /// ties broken by `(clock, hash)`.
    fn topological_order(&self) -> Vec<Hash>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes reachable from `heads` through predecessor links, including the
    /// heads themselves. Heads that are not stored are still included.
    fn closure(&self, heads: &[Hash]) -> HashSet<Hash> {
        let mut known = HashSet::new();
        let mut queue: VecDeque<Hash> = heads.iter().copied().collect();

        while let Some(hash) = queue.pop_front() {
            if known.insert(hash) {
                if let Some(entry) = self.get(&hash) {
                    queue.extend(entry.next.iter().copied());
                }
            }
        }

        known
    }

    /// Push buffered state to the backend.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory implementation of EntryStore.
#[derive(Clone, Debug, Default)]
pub struct MemoryEntryStore {
    /// All entries indexed by hash.
    entries: HashMap<Hash, Entry>,

    /// Current heads.
    heads: HashSet<Hash>,

    /// Reverse index: predecessor -> successors.
    children_index: HashMap<Hash, HashSet<Hash>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_heads(&mut self, entry: &Entry) {
        // A successor may only be stored after this entry, so the new entry
        // never has a known successor yet.
        self.heads.insert(entry.hash);
        for parent in &entry.next {
            self.heads.remove(parent);
        }
    }

    fn update_children_index(&mut self, entry: &Entry) {
        for parent in &entry.next {
            self.children_index
                .entry(*parent)
                .or_default()
                .insert(entry.hash);
        }
    }
}

impl EntryStore for MemoryEntryStore {
    fn get(&self, hash: &Hash) -> Option<&Entry> {
        self.entries.get(hash)
    }

    fn put(&mut self, entry: Entry) -> Result<Hash, StoreError> {
        if let Err(fault) = entry.validate() {
            return Err(StoreError::VerificationFailed(entry.hash, fault));
        }

        if self.entries.contains_key(&entry.hash) {
            return Ok(entry.hash);
        }

        let missing: Vec<Hash> = entry
            .next
            .iter()
            .filter(|p| !self.entries.contains_key(p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingParents(missing));
        }

        let parent_clock = entry
            .next
            .iter()
            .filter_map(|p| self.entries.get(p))
            .map(|p| p.clock)
            .max()
            .unwrap_or(0);
        if entry.clock <= parent_clock {
            return Err(StoreError::VerificationFailed(
                entry.hash,
                EntryFault::ClockRegression {
                    clock: entry.clock,
                    parent_clock,
                },
            ));
        }

        let hash = entry.hash;
        self.update_heads(&entry);
        self.update_children_index(&entry);
        self.entries.insert(hash, entry);

        Ok(hash)
    }

    fn heads(&self) -> Vec<Hash> {
        let mut heads: Vec<_> = self.heads.iter().copied().collect();
        heads.sort();
        heads
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    fn children(&self, hash: &Hash) -> Vec<Hash> {
        let mut children: Vec<Hash> = self
            .children_index
            .get(hash)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    fn topological_order(&self) -> Vec<Hash> {
        // Kahn's algorithm with a (clock, hash) min-heap for a stable order
        let mut in_degree: HashMap<Hash, usize> = HashMap::with_capacity(self.entries.len());
        let mut ready = BinaryHeap::new();
        let mut result = Vec::with_capacity(self.entries.len());

        for (hash, entry) in &self.entries {
            in_degree.insert(*hash, entry.next.len());
            if entry.next.is_empty() {
                ready.push(Reverse((entry.clock, *hash)));
            }
        }

        while let Some(Reverse((_, hash))) = ready.pop() {
            result.push(hash);

            if let Some(children) = self.children_index.get(&hash) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            if let Some(entry) = self.entries.get(child) {
                                ready.push(Reverse((entry.clock, *child)));
                            }
                        }
                    }
                }
            }
        }

        result
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
