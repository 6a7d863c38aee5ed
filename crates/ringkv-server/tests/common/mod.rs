// Common test utilities for server integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ringkv::{
    Connector, Dispatcher, Error, HandoffCoordinator, HandoffMode, KvMessage, KvStore, NodeId,
    Replicator, Result, ServerState, SharedHasher, StatusType, StorageConfig, SyncMode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Connector that hands messages straight to in-process dispatchers.
///
/// Clones share the same peer table and fault plan.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    peers: Mutex<HashMap<NodeId, Arc<Dispatcher>>>,
    put_server_seen: AtomicUsize,
    fail_put_server_at: Mutex<Option<usize>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &NodeId, dispatcher: Arc<Dispatcher>) {
        self.shared
            .peers
            .lock()
            .unwrap()
            .insert(node.clone(), dispatcher);
    }

    pub fn unregister(&self, node: &NodeId) {
        self.shared.peers.lock().unwrap().remove(node);
    }

    /// Drop the `n`-th `put_server` (1-based) sent through any transport
    pub fn fail_put_server_at(&self, n: usize) {
        *self.shared.fail_put_server_at.lock().unwrap() = Some(n);
    }

    /// Shared handle usable wherever a connector is expected
    pub fn shared(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }
}

impl Shared {
    fn should_fail(&self, message: &KvMessage) -> bool {
        if message.status() != StatusType::PutServer {
            return false;
        }
        let seen = self.put_server_seen.fetch_add(1, Ordering::SeqCst) + 1;
        *self.fail_put_server_at.lock().unwrap() == Some(seen)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, peer: &NodeId) -> Result<Box<dyn Transport>> {
        let dispatcher = self
            .shared
            .peers
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Communication(format!("Connection refused by {}", peer)))?;
        Ok(Box::new(LoopbackTransport {
            dispatcher,
            shared: Arc::clone(&self.shared),
            replies: VecDeque::new(),
        }))
    }
}

struct LoopbackTransport {
    dispatcher: Arc<Dispatcher>,
    shared: Arc<Shared>,
    replies: VecDeque<KvMessage>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: &KvMessage) -> Result<()> {
        if self.shared.should_fail(message) {
            return Err(Error::Communication("Injected transfer failure".to_string()));
        }
        let reply = self.dispatcher.dispatch(message.clone()).await;
        self.replies.push_back(reply);
        Ok(())
    }

    async fn receive(&mut self) -> Result<KvMessage> {
        self.replies
            .pop_front()
            .ok_or_else(|| Error::Communication("No reply pending".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One server wired to a [`LoopbackConnector`], storing under a temp dir
pub struct TestNode {
    pub id: NodeId,
    pub store: KvStore,
    pub state: Arc<ServerState>,
    pub dispatcher: Arc<Dispatcher>,
    _temp_dir: TempDir,
}

impl TestNode {
    /// A node waiting for metadata from the coordinator
    pub fn new(
        id: NodeId,
        hasher: SharedHasher,
        connector: &LoopbackConnector,
        mode: HandoffMode,
    ) -> Self {
        let state = Arc::new(ServerState::new(id.clone(), hasher.clone()));
        Self::with_state(id, hasher, connector, connector, mode, state)
    }

    /// A waiting node keeping `replicas` extra copies of every key it owns
    pub fn replicated(
        id: NodeId,
        hasher: SharedHasher,
        connector: &LoopbackConnector,
        mode: HandoffMode,
        replicas: usize,
    ) -> Self {
        let state = ServerState::new(id.clone(), hasher.clone()).with_replicas(replicas);
        Self::with_state(id, hasher, connector, connector, mode, Arc::new(state))
    }

    /// A node that owns the whole ring
    pub fn standalone(
        id: NodeId,
        hasher: SharedHasher,
        connector: &LoopbackConnector,
        mode: HandoffMode,
    ) -> Self {
        let state = Arc::new(ServerState::standalone(id.clone(), hasher.clone()).unwrap());
        Self::with_state(id, hasher, connector, connector, mode, state)
    }

    /// A waiting node reachable through `registry` whose own outbound
    /// connections only see the peers registered with `outbound`
    pub fn with_outbound(
        id: NodeId,
        hasher: SharedHasher,
        registry: &LoopbackConnector,
        outbound: &LoopbackConnector,
        mode: HandoffMode,
    ) -> Self {
        let state = Arc::new(ServerState::new(id.clone(), hasher.clone()));
        Self::with_state(id, hasher, registry, outbound, mode, state)
    }

    fn with_state(
        id: NodeId,
        hasher: SharedHasher,
        registry: &LoopbackConnector,
        outbound: &LoopbackConnector,
        mode: HandoffMode,
        state: Arc<ServerState>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = StorageConfig {
            minimum_degree: 2,
            sync_mode: SyncMode::None,
        };
        let store = KvStore::open(temp_dir.path().join("store"), config, hasher)
            .expect("Failed to open store");
        let handoff = HandoffCoordinator::new(store.clone(), outbound.shared());
        let replicator = Replicator::new(id.clone(), store.clone(), outbound.shared());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state),
            store.clone(),
            handoff,
            replicator,
            mode,
        ));
        registry.register(&id, Arc::clone(&dispatcher));

        Self {
            id,
            store,
            state,
            dispatcher,
            _temp_dir: temp_dir,
        }
    }

    /// Send one request line and return the reply line
    pub async fn request(&self, line: &str) -> String {
        self.dispatcher.dispatch_line(line).await.to_string()
    }
}

pub fn node(port: u16) -> NodeId {
    NodeId::new("127.0.0.1", port)
}
