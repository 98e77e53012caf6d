//! # swarm-log
//!
//! Hash-linked replicated operation log for the shardswarm node.
//!
//! This crate provides:
//! - Signed, content-addressed log entries linked to their causal predecessors
//! - An entry store that only accepts causally complete entries and tracks heads
//! - A last-writer-wins document view folded from the entry DAG
//! - A bounded buffer for entries that arrive before their predecessors
//! - Heads-diff planning for reconciling two replicas
//!
//! ## Architecture
//!
//! Each collection is one [`OpLog`]:
//! 1. Local writes are appended on top of the current heads
//! 2. Remote entries are applied once their predecessors are present
//! 3. Concurrent writes to a key resolve by `(clock, hash)`, so every replica
//!    that holds the same entries shows the same document
//!
//! ## Example
//!
//! ```rust
//! use swarm_log::{Identity, Op, OpLog};
//! use serde_json::json;
//!
//! let a = OpLog::new("caselaw-1-of-8", Identity::from_seed([1u8; 32]));
//! let b = OpLog::new("caselaw-1-of-8", Identity::from_seed([2u8; 32]));
//!
//! a.append(Op::put("doc1", json!("A"))).unwrap();
//!
//! // Ship whatever b is missing
//! for entry in a.plan_for(&b.heads(), &[]) {
//!     b.apply(entry, Some("a")).unwrap();
//! }
//!
//! assert_eq!(b.get("doc1"), Some(json!("A")));
//! assert_eq!(a.heads(), b.heads());
//! ```

mod document;
mod entry;
mod error;
mod hash;
mod identity;
mod log;
mod orphan;
mod store;
mod sync;

pub use document::{Document, Register, Scan};
pub use entry::{Entry, EntryBuilder, EntryFault, Op};
pub use error::{LogError, Result};
pub use hash::{Hash, Hasher};
pub use identity::{AccessController, AllowList, Author, Identity, OpenAccess};
pub use log::{Applied, LogEvent, OpLog, OpLogBuilder};
pub use orphan::{Orphan, OrphanBuffer, OrphanConfig};
pub use store::{EntryStore, MemoryEntryStore, StoreError};
pub use sync::{is_synced_with, missing_for, SyncSimulator};
