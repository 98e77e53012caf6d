use serde_json::{json, Value};
use std::time::Duration;
use swarm_log::{Entry, EntryStore, Hash, MemoryEntryStore, StoreError};
use swarm_node::{
    create_network, Transport, Dispatcher, MemoryHub, MemoryTransport, Node, NodeConfig, NodeEvent, NodeState, SessionState,
    SyncConfigBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

fn config(seed: u8) -> NodeConfig {
    NodeConfig::builder()
        .identity_seed([seed; 32])
        .join_grace(Duration::from_millis(50))
        .ping_timeout(Duration::from_millis(500))
        .sync(
            SyncConfigBuilder::new()
                .announce_interval(Duration::from_millis(100))
                .disconnect_grace(Duration::from_millis(100))
                .build(),
        )
        .build()
}

async fn start(seed: u8, transport: MemoryTransport) -> (Node<MemoryTransport>, Dispatcher<MemoryTransport>) {
    let config = config(seed);
    let node = Node::start(config.clone(), config.identity(), transport).await.unwrap();
    assert_eq!(node.wait_ready().await, NodeState::Ready);
    let dispatcher = Dispatcher::new(node.clone());
    (node, dispatcher)
}

async fn request(dispatcher: &Dispatcher<MemoryTransport>, request: Value) -> Value {
    let reply = dispatcher.handle_text(&request.to_string()).await;
    serde_json::from_str(&reply).unwrap()
}

/// A store whose backend rejects every write.
struct BrokenStore(MemoryEntryStore);

impl EntryStore for BrokenStore {
    fn get(&self, hash: &Hash) -> Option<&Entry> {
        self.0.get(hash)
    }

    fn put(&mut self, _entry: Entry) -> Result<Hash, StoreError> {
        Err(StoreError::Backend("disk full".into()))
    }

    fn heads(&self) -> Vec<Hash> {
        self.0.heads()
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.0.contains(hash)
    }

    fn children(&self, hash: &Hash) -> Vec<Hash> {
        self.0.children(hash)
    }

    fn topological_order(&self) -> Vec<Hash> {
        self.0.topological_order()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

async fn start_broken(seed: u8, transport: MemoryTransport) -> Node<MemoryTransport> {
    let config = config(seed);
    let store = Box::new(BrokenStore(MemoryEntryStore::new()));
    let node = Node::start_with_store(config.clone(), config.identity(), transport, store)
        .await
        .unwrap();
    assert_eq!(node.wait_ready().await, NodeState::Ready);
    node
}

/// Poll until `check` holds or the wait runs out.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_lifecycle_joining_to_ready_to_stopped() {
    let hub = MemoryHub::new();
    let config = config(1);
    let node = Node::start(config.clone(), config.identity(), hub.transport("a")).await.unwrap();
    assert_eq!(node.state(), NodeState::Joining);

    let dispatcher = Dispatcher::new(node.clone());
    let reply = request(&dispatcher, json!({ "select": "doc1" })).await;
    assert_eq!(reply["error"]["Node not ready"]["state"], json!("joining"));

    assert_eq!(node.wait_ready().await, NodeState::Ready);
    assert_eq!(node.collection(), "caselaw-1-of-8");

    node.shutdown().await.unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    node.shutdown().await.unwrap();
    assert!(node.fatal_error().is_none());
}

#[tokio::test]
async fn test_insert_replicates_to_peer() {
    let mut transports = create_network(2).await;
    let (b, _) = start(2, transports.pop().unwrap()).await;
    let (a, dispatcher) = start(1, transports.pop().unwrap()).await;

    let reply = request(&dispatcher, json!({ "insert": { "doc1": "A" } })).await;
    assert_eq!(reply["insert"]["key"], json!("doc1"));
    assert_eq!(reply["insert"]["value"], json!({ "_id": "doc1", "content": "A" }));
    assert!(reply["insert"]["hash"].is_string());

    assert!(eventually(|| b.log().get("doc1") == Some(json!({ "_id": "doc1", "content": "A" }))).await);
    assert!(eventually(|| a.log().heads() == b.log().heads()).await);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = MemoryHub::new();
    let (a, dispatcher) = start(1, hub.transport("a")).await;
    for i in 0..3 {
        request(&dispatcher, json!({ "insert": { format!("doc{}", i): i } })).await;
    }

    let (b, _) = start(2, hub.transport("b")).await;
    b.connect("a").await.unwrap();

    assert!(eventually(|| b.log().len() == 3).await);
    assert_eq!(a.log().heads(), b.log().heads());
    assert!(eventually(|| b.session_state(a.id()) == Some(SessionState::Synced)).await);
}

#[tokio::test]
async fn test_update_missing_and_unchanged() {
    let hub = MemoryHub::new();
    let (node, dispatcher) = start(1, hub.transport("a")).await;

    let reply = request(&dispatcher, json!({ "update": { "missing": "x" } })).await;
    assert_eq!(reply, json!({ "error": { "Document not found": "missing" } }));

    request(&dispatcher, json!({ "insert": { "k": "v" } })).await;
    let len = node.log().len();

    let reply = request(&dispatcher, json!({ "update": { "k": "v" } })).await;
    assert_eq!(
        reply,
        json!({ "error": { "Data already up to date": { "doc": { "_id": "k", "content": "v" }, "key": "k" } } })
    );
    assert_eq!(node.log().len(), len);

    let reply = request(&dispatcher, json!({ "update": { "k": "w" } })).await;
    assert_eq!(reply["update"]["value"]["content"], json!("w"));
    assert_eq!(node.log().len(), len + 1);
}

#[tokio::test]
async fn test_select_delete_and_select_all() {
    let hub = MemoryHub::new();
    let (node, dispatcher) = start(1, hub.transport("a")).await;

    request(&dispatcher, json!({ "insert": { "a": 1 } })).await;
    request(&dispatcher, json!({ "insert": { "b": 2 } })).await;

    let reply = request(&dispatcher, json!({ "select": "a" })).await;
    assert_eq!(reply, json!({ "select": { "_id": "a", "content": 1 } }));

    let reply = request(&dispatcher, json!({ "delete": "a" })).await;
    assert_eq!(reply, json!({ "delete": { "_id": "a", "content": 1 } }));

    let reply = request(&dispatcher, json!({ "delete": "a" })).await;
    assert_eq!(reply, json!({ "error": { "Document not found": "a" } }));

    let reply = request(&dispatcher, json!({ "select_all": null })).await;
    assert_eq!(reply, json!({ "select_all": [{ "_id": "b", "content": 2 }] }));
    assert_eq!(node.log().len(), 3);

    let reply = request(&dispatcher, json!({ "truncate": null })).await;
    assert_eq!(reply["error"]["Unknown command"]["command"], json!("truncate"));
}

#[tokio::test]
async fn test_concurrent_writes_converge_after_connect() {
    let hub = MemoryHub::new();
    let (a, da) = start(1, hub.transport("a")).await;
    let (b, db) = start(2, hub.transport("b")).await;

    request(&da, json!({ "insert": { "doc1": "A" } })).await;
    request(&db, json!({ "insert": { "doc1": "B" } })).await;

    a.connect("b").await.unwrap();

    assert!(eventually(|| a.log().len() == 2 && b.log().len() == 2).await);
    assert!(eventually(|| a.log().heads() == b.log().heads()).await);
    assert_eq!(a.log().get("doc1"), b.log().get("doc1"));
}

#[tokio::test]
async fn test_pubsub_reaches_peer() {
    let mut transports = create_network(2).await;
    let (b, _) = start(2, transports.pop().unwrap()).await;
    let (_a, dispatcher) = start(1, transports.pop().unwrap()).await;
    let mut events = b.subscribe();

    let reply = request(&dispatcher, json!({ "pubsub": { "topic": "news", "message": "hello" } })).await;
    assert_eq!(reply["pubsub"]["sent"], json!(1));

    let received = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(NodeEvent::Pubsub { topic, payload, .. }) = events.recv().await {
                return (topic, payload);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, ("news".to_string(), b"hello".to_vec()));
}

#[tokio::test]
async fn test_peers_and_ping() {
    let mut transports = create_network(2).await;
    let (_b, _) = start(2, transports.pop().unwrap()).await;
    let (a, dispatcher) = start(1, transports.pop().unwrap()).await;

    assert!(eventually(|| a.session_state(&swarm_node::PeerId::new("peer-1")).is_some()).await);

    let reply = request(&dispatcher, json!({ "peers": null })).await;
    let peers = reply["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], json!("peer-1"));

    let reply = request(&dispatcher, json!({ "ping": null })).await;
    assert!(reply["ping"]["peer-1"].is_u64());
}

#[tokio::test]
async fn test_disconnect_keeps_applied_entries() {
    let hub = MemoryHub::new();
    let (a, dispatcher) = start(1, hub.transport("a")).await;
    let (b, _) = start(2, hub.transport("b")).await;
    b.connect("a").await.unwrap();

    request(&dispatcher, json!({ "insert": { "doc1": "A" } })).await;
    assert!(eventually(|| b.log().len() == 1).await);

    b.transport().disconnect(a.id()).await.unwrap();
    assert!(eventually(|| b.session_state(a.id()).is_none()).await);
    assert_eq!(b.log().get("doc1"), Some(json!({ "_id": "doc1", "content": "A" })));

    // Reconnecting only ships what b is missing.
    request(&dispatcher, json!({ "insert": { "doc2": "B" } })).await;
    b.connect("a").await.unwrap();
    assert!(eventually(|| b.log().len() == 2).await);
}

#[tokio::test]
async fn test_local_write_storage_failure_stops_node() {
    let hub = MemoryHub::new();
    let node = start_broken(1, hub.transport("a")).await;
    let mut events = node.subscribe();
    let dispatcher = Dispatcher::new(node.clone());

    let reply = request(&dispatcher, json!({ "insert": { "doc1": "A" } })).await;
    assert_eq!(reply["error"]["StorageError"], json!("storage failure: disk full"));

    assert_eq!(node.state(), NodeState::Stopped);
    assert!(node.fatal_error().unwrap().contains("disk full"));
    let fatal = loop {
        match events.recv().await.unwrap() {
            NodeEvent::Fatal(reason) => break reason,
            _ => continue,
        }
    };
    assert!(fatal.contains("disk full"));

    let reply = request(&dispatcher, json!({ "select": "doc1" })).await;
    assert_eq!(reply["error"]["Node not ready"]["state"], json!("stopped"));
}

#[tokio::test]
async fn test_remote_entry_storage_failure_stops_node() {
    let mut transports = create_network(2).await;
    let b = start_broken(2, transports.pop().unwrap()).await;
    let (a, dispatcher) = start(1, transports.pop().unwrap()).await;

    request(&dispatcher, json!({ "insert": { "doc1": "A" } })).await;

    tokio::time::timeout(WAIT, b.stopped()).await.unwrap();
    assert_eq!(b.state(), NodeState::Stopped);
    assert!(b.fatal_error().unwrap().contains("disk full"));
    assert_eq!(a.state(), NodeState::Ready);

    a.shutdown().await.unwrap();
}
