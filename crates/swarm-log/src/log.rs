//! The replicated operation log of one collection.
//!
//! `OpLog` ties the entry store, the document view and the orphan buffer
//! together behind one mutex. `append` and `apply` are the only mutators and
//! never do I/O while holding the lock. Reads take a cheap snapshot.

use crate::document::{Document, Scan};
use crate::entry::{Entry, EntryBuilder, Op};
use crate::error::{LogError, Result};
use crate::hash::Hash;
use crate::identity::{AccessController, Identity, OpenAccess};
use crate::orphan::{Orphan, OrphanBuffer, OrphanConfig};
use crate::store::{EntryStore, MemoryEntryStore, StoreError};
use crate::sync;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Outcome of [`OpLog::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The entry was folded in, followed by `released` previously buffered
    /// entries that it unblocked (in the order they were applied).
    Applied { released: Vec<Hash> },

    /// Predecessors are missing; the entry waits in the orphan buffer.
    Buffered { missing: Vec<Hash> },

    /// Already applied or already buffered.
    Duplicate,
}

/// Notifications published by the log.
#[derive(Clone, Debug)]
pub enum LogEvent {
    /// An entry was applied. Published exactly once per entry.
    Applied(Entry),

    /// A buffered entry was discarded without ever being applied.
    Orphaned { hash: Hash, origin: Option<String> },
}

struct LogState {
    store: Box<dyn EntryStore>,
    document: Document,
    orphans: OrphanBuffer,
}

/// Builder for [`OpLog`].
pub struct OpLogBuilder {
    name: String,
    identity: Identity,
    access: Arc<dyn AccessController>,
    store: Box<dyn EntryStore>,
    orphan_config: OrphanConfig,
    event_capacity: usize,
}

impl OpLogBuilder {
    pub fn access(mut self, access: Arc<dyn AccessController>) -> Self {
        self.access = access;
        self
    }

    pub fn store(mut self, store: Box<dyn EntryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn orphan_config(mut self, config: OrphanConfig) -> Self {
        self.orphan_config = config;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> OpLog {
        // Rebuild the derived view from whatever the store already holds.
        let mut document = Document::new();
        for hash in self.store.topological_order() {
            if let Some(entry) = self.store.get(&hash) {
                document.fold(entry);
            }
        }
        let (events, _) = broadcast::channel(self.event_capacity);

        OpLog {
            name: self.name,
            identity: self.identity,
            access: self.access,
            state: Mutex::new(LogState {
                store: self.store,
                document,
                orphans: OrphanBuffer::new(self.orphan_config),
            }),
            events,
        }
    }
}

/// Append-only, hash-linked log with a materialized document view.
pub struct OpLog {
    name: String,
    identity: Identity,
    access: Arc<dyn AccessController>,
    state: Mutex<LogState>,
    events: broadcast::Sender<LogEvent>,
}

impl OpLog {
    /// In-memory log with open write access.
    pub fn new(name: impl Into<String>, identity: Identity) -> Self {
        Self::builder(name, identity).build()
    }

    pub fn builder(name: impl Into<String>, identity: Identity) -> OpLogBuilder {
        OpLogBuilder {
            name: name.into(),
            identity,
            access: Arc::new(OpenAccess),
            store: Box::new(MemoryEntryStore::new()),
            orphan_config: OrphanConfig::default(),
            event_capacity: 1024,
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Subscribe to applied and orphaned entries.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Append a local operation on top of the current heads.
    pub fn append(&self, op: Op) -> Result<Entry> {
        let author = self.identity.author();
        if !self.access.can_append(author, &op) {
            return Err(LogError::WriteRejected {
                author: author.id.clone(),
                key: op.key().to_string(),
            });
        }

        let entry = {
            let mut state = self.state.lock();
            let next = state.store.heads();
            let clock = next
                .iter()
                .filter_map(|h| state.store.get(h))
                .map(|e| e.clock)
                .max()
                .unwrap_or(0)
                + 1;
            let entry = EntryBuilder::new()
                .with_next(next)
                .with_op(op)
                .with_clock(clock)
                .sign(&self.identity);

            state.store.put(entry.clone())?;
            state.document.fold(&entry);
            entry
        };

        debug!(log = %self.name, hash = %entry.hash.short(), key = entry.key(), "appended entry");
        let _ = self.events.send(LogEvent::Applied(entry.clone()));
        Ok(entry)
    }

    /// Apply an entry received from elsewhere.
    ///
    /// The entry is only folded once all of its predecessors are applied;
    /// until then it is buffered. Applying it may release buffered entries.
    /// Integrity is checked once, by the store, after the duplicate check.
    pub fn apply(&self, entry: Entry, origin: Option<&str>) -> Result<Applied> {
        if !self.access.can_append(&entry.author, &entry.payload) {
            return Err(LogError::WriteRejected {
                author: entry.author.id.clone(),
                key: entry.key().to_string(),
            });
        }

        let mut applied = Vec::new();
        let mut dropped = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if state.store.contains(&entry.hash) || state.orphans.contains(&entry.hash) {
                return Ok(Applied::Duplicate);
            }

            match state.store.put(entry.clone()) {
                Ok(_) => {
                    state.document.fold(&entry);
                    applied.push(entry);
                    Self::release_waiting(&mut state, &mut applied, &mut dropped)
                        .map(|released| Applied::Applied { released })
                        .map_err(LogError::from)
                }
                Err(StoreError::MissingParents(missing)) => {
                    let evicted = state.orphans.insert(
                        entry,
                        origin.map(str::to_string),
                        &missing,
                        Instant::now(),
                    );
                    dropped.extend(evicted);
                    Ok(Applied::Buffered { missing })
                }
                Err(StoreError::VerificationFailed(hash, reason)) => {
                    return Err(LogError::MalformedEntry { hash, reason });
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Entries folded before a backend failure are still announced.
        for entry in applied {
            debug!(log = %self.name, hash = %entry.hash.short(), key = entry.key(), "applied entry");
            let _ = self.events.send(LogEvent::Applied(entry));
        }
        self.report_dropped(dropped);

        outcome
    }

    /// Retry orphans unblocked by the entries in `applied`, cascading.
    ///
    /// Only faults of the orphan itself drop it. A backend failure stops the
    /// cascade with every orphan not yet applied still buffered.
    fn release_waiting(
        state: &mut LogState,
        applied: &mut Vec<Entry>,
        dropped: &mut Vec<Orphan>,
    ) -> std::result::Result<Vec<Hash>, StoreError> {
        let mut released = Vec::new();
        let mut frontier: VecDeque<Hash> = applied.iter().map(|e| e.hash).collect();

        while let Some(parent) = frontier.pop_front() {
            let mut batch = state.orphans.release(&parent).into_iter();
            while let Some(orphan) = batch.next() {
                match state.store.put(orphan.entry.clone()) {
                    Ok(hash) => {
                        state.document.fold(&orphan.entry);
                        released.push(hash);
                        frontier.push_back(hash);
                        applied.push(orphan.entry);
                    }
                    Err(StoreError::MissingParents(missing)) => {
                        dropped.extend(state.orphans.requeue(orphan, &missing));
                    }
                    Err(StoreError::VerificationFailed(..)) => dropped.push(orphan),
                    Err(err) => {
                        state.orphans.restore(orphan);
                        batch.for_each(|rest| state.orphans.restore(rest));
                        return Err(err);
                    }
                }
            }
        }

        Ok(released)
    }

    fn report_dropped(&self, dropped: Vec<Orphan>) {
        for orphan in dropped {
            warn!(
                log = %self.name,
                hash = %orphan.entry.hash.short(),
                origin = orphan.origin.as_deref().unwrap_or("local"),
                attempts = orphan.attempts,
                "dropping orphan entry"
            );
            let _ = self.events.send(LogEvent::Orphaned {
                hash: orphan.entry.hash,
                origin: orphan.origin,
            });
        }
    }

    /// Drop buffered entries that exceeded their age budget.
    pub fn expire_orphans(&self, now: Instant) -> Vec<LogError> {
        let expired = self.state.lock().orphans.expire(now);
        let errors = expired.iter().map(|o| LogError::OrphanEntry(o.entry.hash)).collect();
        self.report_dropped(expired);
        errors
    }

    /// Drop buffered entries that came from `origin`.
    pub fn drop_orphans_from(&self, origin: &str) -> Vec<LogError> {
        let dropped = self.state.lock().orphans.drop_from(origin);
        let errors = dropped.iter().map(|o| LogError::OrphanEntry(o.entry.hash)).collect();
        self.report_dropped(dropped);
        errors
    }

    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.len()
    }

    /// Snapshot of the current heads, sorted.
    pub fn heads(&self) -> Vec<Hash> {
        self.state.lock().store.heads()
    }

    /// Number of applied entries.
    pub fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.lock().store.contains(hash)
    }

    pub fn get_entry(&self, hash: &Hash) -> Option<Entry> {
        self.state.lock().store.get(hash).cloned()
    }

    /// Current value of `key`, `None` when absent or deleted.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().document.get(key).cloned()
    }

    /// Snapshot-consistent scan over the document.
    pub fn scan(&self) -> Scan {
        self.state.lock().document.scan()
    }

    /// Copy-on-write snapshot of the whole document.
    pub fn document(&self) -> Document {
        self.state.lock().document.clone()
    }

    /// Entries a peer with `peer_heads` is missing, in causal order.
    pub fn plan_for(&self, peer_heads: &[Hash], last_known: &[Hash]) -> Vec<Entry> {
        let state = self.state.lock();
        sync::missing_for(state.store.as_ref(), peer_heads, last_known)
    }

    /// Applied entries not reachable from `heads`, in causal order.
    pub fn entries_since(&self, heads: &[Hash]) -> Vec<Entry> {
        self.plan_for(heads, &[])
    }

    /// Run `f` against the underlying store while holding the lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&dyn EntryStore) -> R) -> R {
        let state = self.state.lock();
        f(state.store.as_ref())
    }

    /// Flush the store backend.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().store.flush().map_err(LogError::from)
    }
}

impl std::fmt::Debug for OpLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLog")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
