//! Per-peer sync sessions.
//!
//! A session walks through `Discovered -> Joined -> Syncing -> Synced` and
//! ends in `Disconnected`:
//! 1. On connect both sides send their heads
//! 2. When the peer's heads arrive the session is `Joined`; it plans the
//!    entries the peer is missing and sends them, then `SyncDone`
//! 3. Once both directions are done the session is `Synced` and keeps
//!    pushing newly applied entries to the peer
//!
//! [`SyncSession`] holds the state machine and produces frames without doing
//! I/O. [`run_session`] drives it for one connected peer.

use crate::config::SyncConfig;
use crate::error::NodeError;
use crate::network::{PeerId, Transport};
use crate::protocol::Frame;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use swarm_log::{Applied, Entry, Hash, LogError, LogEvent, OpLog};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sync state with one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Discovered,
    Joined,
    Syncing,
    Synced,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Discovered => "discovered",
            SessionState::Joined => "joined",
            SessionState::Syncing => "syncing",
            SessionState::Synced => "synced",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// What a step of the session produced.
#[derive(Debug, Default)]
pub struct Step {
    /// Frames to send to the peer, in order.
    pub outbound: Vec<Frame>,
    /// Set when the session reached `Synced` in this step.
    pub synced: bool,
}

/// Hashes exchanged with the peer. Once over capacity the oldest are
/// forgotten, so a long session may resend an old entry, which the peer
/// treats as a duplicate.
struct Exchanged {
    hashes: HashSet<Hash>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl Exchanged {
    fn new(capacity: usize) -> Self {
        Self {
            hashes: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    fn insert(&mut self, hash: Hash) {
        if !self.hashes.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.hashes.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.hashes.len()
    }
}

/// Sync state machine for one peer.
pub struct SyncSession {
    peer: PeerId,
    collection: String,
    config: SyncConfig,
    state: SessionState,

    /// Heads the peer held at the end of an earlier session.
    last_known: Vec<Hash>,

    /// Entries sent this session, most recent only.
    sent: Exchanged,

    /// Entries received this session, most recent only.
    received: Exchanged,

    /// Our plan went out.
    sent_done: bool,

    /// The peer's plan came in.
    received_done: bool,

    rejects: u32,
}

impl SyncSession {
    pub fn new(peer: PeerId, collection: impl Into<String>, config: SyncConfig, last_known: Vec<Hash>) -> Self {
        let remembered = config.remembered_hashes;
        Self {
            peer,
            collection: collection.into(),
            config,
            state: SessionState::Discovered,
            last_known,
            sent: Exchanged::new(remembered),
            received: Exchanged::new(remembered),
            sent_done: false,
            received_done: false,
            rejects: 0,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Heads to remember for the next session with this peer.
    pub fn last_known(&self) -> &[Hash] {
        &self.last_known
    }

    pub fn rejects(&self) -> u32 {
        self.rejects
    }

    /// Hashes currently remembered as sent to or received from the peer.
    pub fn remembered(&self) -> usize {
        self.sent.len() + self.received.len()
    }

    /// Our heads announcement.
    pub fn announce(&self, log: &OpLog) -> Frame {
        Frame::Heads {
            collection: self.collection.clone(),
            heads: log.heads(),
        }
    }

    /// Handle a sync frame from the peer.
    pub fn on_frame(&mut self, log: &OpLog, frame: Frame) -> Result<Step, NodeError> {
        match frame {
            Frame::Heads { collection, heads } => Ok(self.on_heads(log, &collection, heads)),
            Frame::Entries { entries } => self.on_entries(log, entries),
            Frame::SyncDone { heads } => Ok(self.on_sync_done(heads)),
            other => {
                debug!(peer = %self.peer, "session ignores {} frame", other.kind());
                Ok(Step::default())
            }
        }
    }

    fn on_heads(&mut self, log: &OpLog, collection: &str, heads: Vec<Hash>) -> Step {
        if collection != self.collection {
            debug!(peer = %self.peer, %collection, "peer replicates another collection");
            return Step::default();
        }

        let mut step = Step::default();
        if self.state == SessionState::Discovered {
            self.transition(SessionState::Joined);
        }

        let plan: Vec<Entry> = log
            .plan_for(&heads, &self.last_known)
            .into_iter()
            .filter(|e| !self.sent.contains(&e.hash) && !self.received.contains(&e.hash))
            .collect();
        if !plan.is_empty() {
            debug!(peer = %self.peer, entries = plan.len(), "sending missing entries");
        }
        step.outbound.extend(self.batches(plan));

        if !self.sent_done {
            self.sent_done = true;
            step.outbound.push(Frame::SyncDone { heads: log.heads() });
            self.transition(SessionState::Syncing);
            step.synced = self.check_synced();
        }
        step
    }

    fn on_entries(&mut self, log: &OpLog, entries: Vec<Entry>) -> Result<Step, NodeError> {
        let origin = self.peer.0.clone();
        for entry in entries {
            let hash = entry.hash;
            self.received.insert(hash);

            match log.apply(entry, Some(&origin)) {
                Ok(Applied::Applied { released }) => {
                    debug!(peer = %self.peer, hash = %hash.short(), released = released.len(), "applied remote entry");
                }
                Ok(Applied::Buffered { missing }) => {
                    debug!(peer = %self.peer, hash = %hash.short(), missing = missing.len(), "buffered remote entry");
                }
                Ok(Applied::Duplicate) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    self.rejects += 1;
                    warn!(peer = %self.peer, hash = %hash.short(), rejects = self.rejects, "rejected remote entry: {}", err);
                    if self.rejects > self.config.reject_threshold {
                        return Err(match err {
                            LogError::MalformedEntry { .. } => err.into(),
                            other => NodeError::sync_failure(
                                &self.peer,
                                format!("too many rejected entries, last: {}", other),
                            ),
                        });
                    }
                }
            }
        }
        Ok(Step::default())
    }

    fn on_sync_done(&mut self, heads: Vec<Hash>) -> Step {
        self.received_done = true;
        self.last_known = heads;
        Step {
            outbound: Vec::new(),
            synced: self.check_synced(),
        }
    }

    /// A locally applied entry. Pushed once our plan is out, unless the peer
    /// already has it from this session.
    pub fn on_local(&mut self, entry: &Entry) -> Option<Frame> {
        if !self.sent_done || self.state == SessionState::Disconnected {
            return None;
        }
        if self.sent.contains(&entry.hash) || self.received.contains(&entry.hash) {
            return None;
        }
        self.sent.insert(entry.hash);
        Some(Frame::Entries {
            entries: vec![entry.clone()],
        })
    }

    pub fn close(&mut self) {
        self.transition(SessionState::Disconnected);
    }

    fn check_synced(&mut self) -> bool {
        if self.sent_done && self.received_done && self.state == SessionState::Syncing {
            self.transition(SessionState::Synced);
            return true;
        }
        false
    }

    fn batches(&mut self, plan: Vec<Entry>) -> Vec<Frame> {
        for entry in &plan {
            self.sent.insert(entry.hash);
        }
        plan.chunks(self.config.max_batch_size.max(1))
            .map(|chunk| Frame::Entries {
                entries: chunk.to_vec(),
            })
            .collect()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(peer = %self.peer, from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }
}

/// Handle the node keeps for a running session.
pub struct SessionHandle {
    pub frames: mpsc::Sender<Frame>,
    pub state: Arc<RwLock<SessionState>>,
    pub cancel: CancellationToken,
}

/// Reported by a session when it finishes.
pub struct SessionOutcome {
    pub peer: PeerId,
    pub last_known: Vec<Hash>,
    pub result: Result<(), NodeError>,
}

/// Drive one session until the peer goes away, the node shuts down or the
/// session fails. `on_synced` is called each time the session becomes
/// `Synced`.
pub async fn run_session<T: Transport>(
    mut session: SyncSession,
    log: Arc<OpLog>,
    transport: Arc<T>,
    mut frames: mpsc::Receiver<Frame>,
    shared_state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    on_synced: impl Fn(&PeerId) + Send,
) -> SessionOutcome {
    let mut log_events = log.subscribe();
    let peer = session.peer().clone();
    let mut ticker = tokio::time::interval(session.config.announce_interval);
    ticker.tick().await;

    let result: Result<(), NodeError> = async {
        transport.send(&peer, session.announce(&log)).await.map_err(|e| NodeError::sync_failure(&peer, e))?;

        loop {
            let outbound = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    let step = session.on_frame(&log, frame)?;
                    if step.synced {
                        info!(peer = %peer, "peer synced");
                        on_synced(&peer);
                    }
                    step.outbound
                }
                event = log_events.recv() => match event {
                    Ok(LogEvent::Applied(entry)) => session.on_local(&entry).into_iter().collect(),
                    Ok(LogEvent::Orphaned { .. }) => Vec::new(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The peer's next heads announcement covers whatever was skipped.
                        debug!(peer = %peer, skipped, "session lagged behind the log");
                        Vec::new()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => vec![session.announce(&log)],
            };

            *shared_state.write() = session.state();
            for frame in outbound {
                transport
                    .send(&peer, frame)
                    .await
                    .map_err(|e| NodeError::sync_failure(&peer, e))?;
            }
        }
        Ok(())
    }
    .await;

    session.close();
    *shared_state.write() = session.state();
    SessionOutcome {
        peer,
        last_known: session.last_known().to_vec(),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarm_log::{EntryBuilder, Identity, Op};

    fn log(seed: u8) -> OpLog {
        OpLog::new("c", Identity::from_seed([seed; 32]))
    }

    fn session(peer: &str) -> SyncSession {
        SyncSession::new(PeerId::new(peer), "c", SyncConfig::default(), Vec::new())
    }

    /// Deliver every frame from one side to the other until both are quiet.
    fn exchange(a: &OpLog, sa: &mut SyncSession, b: &OpLog, sb: &mut SyncSession) {
        let mut to_b = vec![sa.announce(a)];
        let mut to_a = vec![sb.announce(b)];
        while !to_a.is_empty() || !to_b.is_empty() {
            let mut next_to_a = Vec::new();
            for frame in to_b.drain(..) {
                next_to_a.extend(sb.on_frame(b, frame).unwrap().outbound);
            }
            let mut next_to_b = Vec::new();
            for frame in to_a.drain(..) {
                next_to_b.extend(sa.on_frame(a, frame).unwrap().outbound);
            }
            to_a = next_to_a;
            to_b = next_to_b;
        }
    }

    #[test]
    fn test_states_through_sync() {
        let a = log(1);
        let b = log(2);
        a.append(Op::put("k", json!(1))).unwrap();
        b.append(Op::put("j", json!(2))).unwrap();

        let b_before = b.heads();
        let mut sa = session("b");
        let mut sb = session("a");
        assert_eq!(sa.state(), SessionState::Discovered);

        exchange(&a, &mut sa, &b, &mut sb);

        assert_eq!(sa.state(), SessionState::Synced);
        assert_eq!(sb.state(), SessionState::Synced);
        assert_eq!(a.heads(), b.heads());
        assert_eq!(b.get("k"), Some(json!(1)));
        assert_eq!(sa.last_known(), b_before.as_slice());
    }

    #[test]
    fn test_identical_heads_send_no_entries() {
        let a = log(1);
        let b = log(2);
        let e = a.append(Op::put("k", json!(1))).unwrap();
        b.apply(e, None).unwrap();

        let mut sa = session("b");
        let step = sa.on_frame(&a, Frame::Heads { collection: "c".into(), heads: b.heads() }).unwrap();
        assert!(step
            .outbound
            .iter()
            .all(|f| !matches!(f, Frame::Entries { .. })));
        assert!(matches!(step.outbound.last(), Some(Frame::SyncDone { .. })));
    }

    #[test]
    fn test_batches_respect_max_size() {
        let a = log(1);
        for i in 0..5 {
            a.append(Op::put(format!("k{}", i), json!(i))).unwrap();
        }
        let config = SyncConfig {
            max_batch_size: 2,
            ..Default::default()
        };
        let mut sa = SyncSession::new(PeerId::new("b"), "c", config, Vec::new());
        let step = sa.on_frame(&a, Frame::Heads { collection: "c".into(), heads: vec![] }).unwrap();

        let sizes: Vec<usize> = step
            .outbound
            .iter()
            .filter_map(|f| match f {
                Frame::Entries { entries } => Some(entries.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_live_push_once() {
        let a = log(1);
        let mut sa = session("b");
        let before = a.append(Op::put("early", json!(0))).unwrap();
        assert!(sa.on_local(&before).is_none());

        sa.on_frame(&a, Frame::Heads { collection: "c".into(), heads: vec![] }).unwrap();
        // Already part of the plan
        assert!(sa.on_local(&before).is_none());

        let after = a.append(Op::put("late", json!(1))).unwrap();
        assert!(matches!(sa.on_local(&after), Some(Frame::Entries { .. })));
        assert!(sa.on_local(&after).is_none());
    }

    #[test]
    fn test_other_collection_ignored() {
        let a = log(1);
        a.append(Op::put("k", json!(1))).unwrap();
        let mut sa = session("b");
        let step = sa
            .on_frame(&a, Frame::Heads { collection: "other".into(), heads: vec![] })
            .unwrap();
        assert!(step.outbound.is_empty());
        assert_eq!(sa.state(), SessionState::Discovered);
    }

    #[test]
    fn test_reject_threshold_closes_session() {
        let a = log(1);
        let config = SyncConfig {
            reject_threshold: 1,
            ..Default::default()
        };
        let mut sa = SyncSession::new(PeerId::new("evil"), "c", config, Vec::new());

        let forged = |n: u64| {
            let mut e = EntryBuilder::new()
                .with_op(Op::put("k", json!(n)))
                .with_clock(1)
                .sign(&Identity::from_seed([9u8; 32]));
            e.payload = Op::put("k", json!("forged"));
            e
        };

        assert!(sa.on_frame(&a, Frame::Entries { entries: vec![forged(1)] }).is_ok());
        assert_eq!(sa.rejects(), 1);
        let err = sa
            .on_frame(&a, Frame::Entries { entries: vec![forged(2)] })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedEntry);
        assert!(a.is_empty());
    }

    #[test]
    fn test_exchanged_hashes_are_bounded() {
        let a = log(1);
        let config = SyncConfig {
            remembered_hashes: 4,
            ..Default::default()
        };
        let mut sa = SyncSession::new(PeerId::new("b"), "c", config, Vec::new());
        sa.on_frame(&a, Frame::Heads { collection: "c".into(), heads: vec![] }).unwrap();

        let mut pushed = Vec::new();
        for i in 0..10 {
            let entry = a.append(Op::put(format!("k{}", i), json!(i))).unwrap();
            assert!(sa.on_local(&entry).is_some());
            pushed.push(entry);
        }
        assert_eq!(sa.remembered(), 4);

        // Recent pushes are still suppressed
        assert!(sa.on_local(&pushed[9]).is_none());
        assert!(sa.on_local(&pushed[6]).is_none());
    }
}
