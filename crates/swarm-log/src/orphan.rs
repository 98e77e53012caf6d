//! Bounded buffer for entries whose predecessors have not arrived yet.
//!
//! Entries are indexed by the predecessors they wait on. When a predecessor is
//! applied the waiting entries are released for another attempt. The buffer is
//! bounded three ways: total capacity, retry attempts per entry, and age.

use crate::entry::Entry;
use crate::hash::Hash;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Limits for the orphan buffer.
#[derive(Clone, Debug)]
pub struct OrphanConfig {
    /// Maximum number of buffered entries; the oldest is evicted beyond this.
    pub max_entries: usize,

    /// Failed retries after which an entry is dropped.
    pub max_attempts: u32,

    /// Time after which a still-buffered entry is dropped.
    pub max_age: Duration,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        OrphanConfig {
            max_entries: 4096,
            max_attempts: 16,
            max_age: Duration::from_secs(120),
        }
    }
}

/// An entry waiting on missing predecessors.
#[derive(Clone, Debug)]
pub struct Orphan {
    pub entry: Entry,

    /// Peer the entry came from, if remote.
    pub origin: Option<String>,

    /// Failed retries so far.
    pub attempts: u32,

    pub buffered_at: Instant,
}

/// Buffer of orphans keyed by entry hash.
#[derive(Debug, Default)]
pub struct OrphanBuffer {
    config: OrphanConfig,
    orphans: HashMap<Hash, Orphan>,
    /// Arrival order, for capacity eviction. May hold stale hashes.
    order: VecDeque<Hash>,
    /// Missing predecessor -> orphans waiting on it.
    waiting: HashMap<Hash, HashSet<Hash>>,
}

impl OrphanBuffer {
    pub fn new(config: OrphanConfig) -> Self {
        OrphanBuffer {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &OrphanConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Predecessors some buffered entry is waiting on.
    pub fn missing(&self) -> Vec<Hash> {
        let mut missing: Vec<Hash> = self.waiting.keys().copied().collect();
        missing.sort();
        missing
    }

    /// Buffer a new entry. Returns entries evicted to stay within capacity.
    pub fn insert(
        &mut self,
        entry: Entry,
        origin: Option<String>,
        missing: &[Hash],
        now: Instant,
    ) -> Vec<Orphan> {
        let hash = entry.hash;
        if self.orphans.contains_key(&hash) {
            return Vec::new();
        }

        self.index(hash, missing);
        self.orphans.insert(
            hash,
            Orphan {
                entry,
                origin,
                attempts: 0,
                buffered_at: now,
            },
        );
        self.order.push_back(hash);
        if self.order.len() > self.orphans.len() * 2 + 64 {
            let orphans = &self.orphans;
            self.order.retain(|h| orphans.contains_key(h));
        }

        let mut evicted = Vec::new();
        while self.orphans.len() > self.config.max_entries {
            match self.order.pop_front() {
                Some(oldest) => evicted.extend(self.remove(&oldest)),
                None => break,
            }
        }
        evicted
    }

    /// Take every orphan that was waiting on `applied`.
    pub fn release(&mut self, applied: &Hash) -> Vec<Orphan> {
        let Some(waiters) = self.waiting.remove(applied) else {
            return Vec::new();
        };
        let mut released: Vec<Orphan> = waiters.iter().filter_map(|h| self.remove(h)).collect();
        // Deterministic retry order
        released.sort_by_key(|o| (o.entry.clock, o.entry.hash));
        released
    }

    /// Put back an orphan whose retry failed. Returns it if it is now over
    /// the attempt budget and has been dropped instead.
    pub fn requeue(&mut self, mut orphan: Orphan, missing: &[Hash]) -> Option<Orphan> {
        orphan.attempts += 1;
        if orphan.attempts > self.config.max_attempts {
            return Some(orphan);
        }
        let hash = orphan.entry.hash;
        self.index(hash, missing);
        self.orphans.insert(hash, orphan);
        self.order.push_back(hash);
        None
    }

    /// Put back a released orphan that was never retried, as it was.
    pub fn restore(&mut self, orphan: Orphan) {
        let hash = orphan.entry.hash;
        let parents = orphan.entry.next.clone();
        self.index(hash, &parents);
        self.orphans.insert(hash, orphan);
        self.order.push_back(hash);
    }

    /// Drop every orphan older than `max_age`.
    pub fn expire(&mut self, now: Instant) -> Vec<Orphan> {
        let max_age = self.config.max_age;
        let stale: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.buffered_at) > max_age)
            .map(|(h, _)| *h)
            .collect();
        stale.iter().filter_map(|h| self.remove(h)).collect()
    }

    /// Drop every orphan that arrived from `origin`.
    pub fn drop_from(&mut self, origin: &str) -> Vec<Orphan> {
        let from: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, o)| o.origin.as_deref() == Some(origin))
            .map(|(h, _)| *h)
            .collect();
        from.iter().filter_map(|h| self.remove(h)).collect()
    }

    fn index(&mut self, hash: Hash, missing: &[Hash]) {
        for parent in missing {
            self.waiting.entry(*parent).or_default().insert(hash);
        }
    }

    fn remove(&mut self, hash: &Hash) -> Option<Orphan> {
        let orphan = self.orphans.remove(hash)?;
        for parent in &orphan.entry.next {
            if let Some(waiters) = self.waiting.get_mut(parent) {
                waiters.remove(hash);
                if waiters.is_empty() {
                    self.waiting.remove(parent);
                }
            }
        }
        Some(orphan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryBuilder, Op};
    use crate::hash::Hasher;
    use crate::identity::Identity;

    fn orphan_of(parent: Hash, key: &str) -> Entry {
        EntryBuilder::new()
            .with_parent(parent)
            .with_op(Op::delete(key))
            .with_clock(2)
            .sign(&Identity::from_seed([5u8; 32]))
    }

    #[test]
    fn test_release_on_parent() {
        let parent = Hasher::hash(b"parent");
        let mut buffer = OrphanBuffer::new(OrphanConfig::default());
        let child = orphan_of(parent, "a");

        buffer.insert(child.clone(), None, &[parent], Instant::now());
        assert!(buffer.contains(&child.hash));
        assert_eq!(buffer.missing(), vec![parent]);

        let released = buffer.release(&parent);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].entry, child);
        assert!(buffer.is_empty());
        assert!(buffer.missing().is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let parent = Hasher::hash(b"parent");
        let config = OrphanConfig {
            max_entries: 2,
            ..Default::default()
        };
        let mut buffer = OrphanBuffer::new(config);
        let now = Instant::now();

        let first = orphan_of(parent, "1");
        assert!(buffer.insert(first.clone(), None, &[parent], now).is_empty());
        assert!(buffer.insert(orphan_of(parent, "2"), None, &[parent], now).is_empty());
        let evicted = buffer.insert(orphan_of(parent, "3"), None, &[parent], now);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].entry.hash, first.hash);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_attempt_budget() {
        let parent = Hasher::hash(b"parent");
        let config = OrphanConfig {
            max_attempts: 1,
            ..Default::default()
        };
        let mut buffer = OrphanBuffer::new(config);
        buffer.insert(orphan_of(parent, "a"), None, &[parent], Instant::now());

        let orphan = buffer.release(&parent).remove(0);
        assert!(buffer.requeue(orphan, &[parent]).is_none());
        assert_eq!(buffer.len(), 1);

        let orphan = buffer.release(&parent).remove(0);
        let dropped = buffer.requeue(orphan, &[parent]);
        assert_eq!(dropped.map(|o| o.attempts), Some(2));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_restore_keeps_attempts_and_age() {
        let parent = Hasher::hash(b"parent");
        let mut buffer = OrphanBuffer::new(OrphanConfig::default());
        let start = Instant::now();
        let child = orphan_of(parent, "a");
        buffer.insert(child.clone(), Some("peer-a".into()), &[parent], start);

        let orphan = buffer.release(&parent).remove(0);
        buffer.restore(orphan);

        assert!(buffer.contains(&child.hash));
        assert_eq!(buffer.missing(), vec![parent]);
        let again = buffer.release(&parent).remove(0);
        assert_eq!(again.attempts, 0);
        assert_eq!(again.buffered_at, start);
        assert_eq!(again.origin.as_deref(), Some("peer-a"));
    }

    #[test]
    fn test_expire_by_age() {
        let parent = Hasher::hash(b"parent");
        let config = OrphanConfig {
            max_age: Duration::from_secs(5),
            ..Default::default()
        };
        let mut buffer = OrphanBuffer::new(config);
        let start = Instant::now();
        buffer.insert(orphan_of(parent, "a"), None, &[parent], start);

        assert!(buffer.expire(start + Duration::from_secs(1)).is_empty());
        assert_eq!(buffer.expire(start + Duration::from_secs(6)).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drop_from_origin() {
        let parent = Hasher::hash(b"parent");
        let mut buffer = OrphanBuffer::new(OrphanConfig::default());
        let now = Instant::now();
        buffer.insert(orphan_of(parent, "a"), Some("peer-a".into()), &[parent], now);
        buffer.insert(orphan_of(parent, "b"), Some("peer-b".into()), &[parent], now);

        let dropped = buffer.drop_from("peer-a");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].entry.key(), "a");
        assert_eq!(buffer.len(), 1);
    }
}
