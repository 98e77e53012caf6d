//! Materialized key/value view folded from the entry DAG.
//!
//! Every key holds a last-writer-wins register. A write replaces the current
//! one when its `(clock, hash)` tag is greater, so the result only depends on
//! the set of folded entries, never on the order they were folded in. Deletes
//! are kept as tombstones so that a late, older PUT cannot resurrect the key.

use crate::entry::{Entry, Op};
use crate::hash::Hash;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// The winning write for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Register {
    /// `None` for a tombstone.
    pub value: Option<Value>,
    pub clock: u64,
    pub hash: Hash,
}

impl Register {
    fn tag(&self) -> (u64, Hash) {
        (self.clock, self.hash)
    }
}

/// Key/value view of the log. Cloning is cheap; writers copy on write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Document {
    registers: Arc<BTreeMap<String, Register>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into the view. Returns true if the visible state of its
    /// key changed.
    pub fn fold(&mut self, entry: &Entry) -> bool {
        let incoming = Register {
            value: match &entry.payload {
                Op::Put { value, .. } => Some(value.clone()),
                Op::Delete { .. } => None,
            },
            clock: entry.clock,
            hash: entry.hash,
        };

        if let Some(current) = self.registers.get(entry.key()) {
            if current.tag() >= incoming.tag() {
                return false;
            }
        }

        // Copies the map only while a snapshot of it is still alive.
        Arc::make_mut(&mut self.registers).insert(entry.key().to_string(), incoming);
        true
    }

    /// Live value of a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.registers.get(key).and_then(|r| r.value.as_ref())
    }

    /// The register of a key, tombstones included.
    pub fn register(&self, key: &str) -> Option<&Register> {
        self.registers.get(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.registers.values().filter(|r| r.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy scan over the view as it is right now.
    pub fn scan(&self) -> Scan {
        Scan {
            snapshot: Arc::clone(&self.registers),
            cursor: None,
        }
    }
}

/// Restartable, snapshot-consistent iterator over live `(key, value)` pairs.
///
/// The scan holds its own reference to the map, so writers that fold new
/// entries afterwards never block on it and never show up in it.
#[derive(Clone, Debug)]
pub struct Scan {
    snapshot: Arc<BTreeMap<String, Register>>,
    cursor: Option<String>,
}

impl Scan {
    /// Go back to the first key of the same snapshot.
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for Scan {
    type Item = (String, Value);

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.cursor {
            Some(key) => Bound::Excluded(key.as_str()),
            None => Bound::Unbounded,
        };

        let found = self
            .snapshot
            .range::<str, _>((lower, Bound::Unbounded))
            .find_map(|(key, register)| register.value.as_ref().map(|v| (key.clone(), v.clone())));

        match found {
            Some((key, value)) => {
                self.cursor = Some(key.clone());
                Some((key, value))
            }
            None => {
                // Park the cursor past every tombstone we skipped.
                if let Some((last, _)) = self.snapshot.iter().next_back() {
                    self.cursor = Some(last.clone());
                }
                None
            }
        }
    }
}
