//! Node state machine and the node's view of the ring.
//!
//! ```text
//!  STOPPED ── ecs_set_keyrange ──▶ ACTIVE ── ecs_write_lock ──▶ WRITE_LOCKED
//!                                  ACTIVE ◀── ecs_write_unlock | ecs_set_keyrange ── WRITE_LOCKED
//!  ACTIVE | WRITE_LOCKED ── shutdown ──▶ STOPPED
//! ```

use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::{HashRing, RingRange, SharedHasher};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info};

/// Lifecycle state of a key-value server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Serves reads and writes for owned keys
    Active,
    /// Serves reads, rejects writes while data is being handed off
    WriteLocked,
    /// Rejects all client traffic
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Active => "ACTIVE",
            NodeState::WriteLocked => "WRITE_LOCKED",
            NodeState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: NodeState,
    ring: HashRing<SharedHasher>,
}

/// Extra copies kept of every key unless configured otherwise
pub const DEFAULT_REPLICAS: usize = 2;

/// Shared state of one server: lifecycle and ring metadata
pub struct ServerState {
    me: NodeId,
    replicas: usize,
    inner: RwLock<Inner>,
}

impl ServerState {
    /// A node waiting for the coordinator: stopped, with an empty ring
    pub fn new(me: NodeId, hasher: SharedHasher) -> Self {
        Self {
            me,
            replicas: DEFAULT_REPLICAS,
            inner: RwLock::new(Inner {
                state: NodeState::Stopped,
                ring: HashRing::with_hasher(hasher),
            }),
        }
    }

    /// A node running without a coordinator: active and owning everything
    pub fn standalone(me: NodeId, hasher: SharedHasher) -> Result<Self> {
        let mut ring = HashRing::with_hasher(hasher);
        ring.add_node(me.clone())?;
        Ok(Self {
            me,
            replicas: DEFAULT_REPLICAS,
            inner: RwLock::new(Inner {
                state: NodeState::Active,
                ring,
            }),
        })
    }

    /// Keep `replicas` extra copies of every key; `0` disables replication
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.me
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn state(&self) -> Result<NodeState> {
        Ok(self.inner.read().map_err(|_| Error::LockPoisoned)?.state)
    }

    fn transition(&self, allowed: &[NodeState], next: NodeState) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::LockPoisoned)?;
        if inner.state == next {
            return Ok(());
        }
        if !allowed.contains(&inner.state) {
            return Err(Error::InvalidOperation(format!(
                "Cannot move from {} to {}",
                inner.state, next
            )));
        }
        info!(node = %self.me, from = %inner.state, to = %next, "State change");
        inner.state = next;
        Ok(())
    }

    /// Serve traffic; valid from any state
    pub fn start(&self) -> Result<()> {
        self.transition(
            &[NodeState::Stopped, NodeState::WriteLocked],
            NodeState::Active,
        )
    }

    /// Reject writes until [`ServerState::unlock`]
    pub fn write_lock(&self) -> Result<()> {
        self.transition(&[NodeState::Active], NodeState::WriteLocked)
    }

    /// Accept writes again
    pub fn unlock(&self) -> Result<()> {
        self.transition(&[NodeState::WriteLocked], NodeState::Active)
    }

    /// Reject all client traffic; valid from any state
    pub fn stop(&self) -> Result<()> {
        self.transition(
            &[NodeState::Active, NodeState::WriteLocked],
            NodeState::Stopped,
        )
    }

    pub fn can_write(&self) -> Result<bool> {
        Ok(self.state()? == NodeState::Active)
    }

    /// Replace the ring metadata, returning the ring it replaced
    pub fn set_ring(&self, ring: HashRing<SharedHasher>) -> Result<HashRing<SharedHasher>> {
        let mut inner = self.inner.write().map_err(|_| Error::LockPoisoned)?;
        debug!(node = %self.me, members = ring.len(), "Ring metadata updated");
        Ok(std::mem::replace(&mut inner.ring, ring))
    }

    /// Replace the ring metadata from its wire form, returning the ring it replaced
    pub fn set_metadata(&self, metadata: &str) -> Result<HashRing<SharedHasher>> {
        let hasher = self.hasher()?;
        self.set_ring(HashRing::parse(metadata, hasher)?)
    }

    /// Snapshot of the ring metadata
    pub fn ring(&self) -> Result<HashRing<SharedHasher>> {
        Ok(self.inner.read().map_err(|_| Error::LockPoisoned)?.ring.clone())
    }

    /// Ring metadata in wire form
    pub fn metadata(&self) -> Result<String> {
        Ok(self.inner.read().map_err(|_| Error::LockPoisoned)?.ring.serialize())
    }

    pub fn hasher(&self) -> Result<SharedHasher> {
        Ok(self
            .inner
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .ring
            .hasher()
            .clone())
    }

    /// Whether this node owns `key` under the current metadata
    pub fn is_responsible(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        Ok(inner.ring.is_responsible(&self.me, key))
    }

    /// Whether this node holds `key` as owner or replica
    pub fn is_read_responsible(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        Ok(inner.ring.is_read_responsible(&self.me, key, self.replicas))
    }

    /// Replicas a write of `key` goes to: empty unless this node owns the
    /// key and the ring is large enough to replicate
    pub fn replica_targets(&self, key: &str) -> Result<Vec<NodeId>> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        if !inner.ring.is_responsible(&self.me, key) {
            return Ok(Vec::new());
        }
        Ok(inner
            .ring
            .read_responsible(key, self.replicas)
            .into_iter()
            .filter(|holder| **holder != self.me)
            .cloned()
            .collect())
    }

    /// Read arcs of every member in wire form
    pub fn read_metadata(&self) -> Result<String> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        Ok(inner.ring.serialize_read(self.replicas))
    }

    /// Arc this node owns, if it is a ring member
    pub fn own_range(&self) -> Result<Option<RingRange>> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        Ok(inner.ring.range_of(&self.me))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_ring::{DebugHash, Md5Hash};
    use std::sync::Arc;

    fn me() -> NodeId {
        NodeId::new("127.0.0.1", 5000)
    }

    #[test]
    fn test_lifecycle() {
        let state = ServerState::new(me(), Arc::new(Md5Hash));
        assert_eq!(state.state().unwrap(), NodeState::Stopped);
        assert!(state.write_lock().is_err());
        assert!(state.unlock().is_err());

        state.start().unwrap();
        assert!(state.can_write().unwrap());
        state.write_lock().unwrap();
        assert_eq!(state.state().unwrap(), NodeState::WriteLocked);
        assert!(!state.can_write().unwrap());
        state.write_lock().unwrap();
        state.unlock().unwrap();
        assert_eq!(state.state().unwrap(), NodeState::Active);

        state.write_lock().unwrap();
        state.stop().unwrap();
        assert_eq!(state.state().unwrap(), NodeState::Stopped);
    }

    #[test]
    fn test_standalone_owns_everything() {
        let state = ServerState::standalone(me(), Arc::new(Md5Hash)).unwrap();
        assert_eq!(state.state().unwrap(), NodeState::Active);
        assert!(state.is_responsible("anything").unwrap());
        assert_eq!(state.own_range().unwrap().unwrap().len(), u128::MAX);
    }

    #[test]
    fn test_metadata_decides_responsibility() {
        let other = NodeId::new("127.0.0.1", 5001);
        let hasher = DebugHash::new(99)
            .with_node(&me(), 40)
            .with_node(&other, 90)
            .with("mine", 20)
            .with("theirs", 60);
        let state = ServerState::new(me(), Arc::new(hasher));
        assert!(!state.is_responsible("mine").unwrap());

        state
            .set_metadata("28,5b,127.0.0.1:5000;5a,29,127.0.0.1:5001;")
            .unwrap();
        assert!(state.is_responsible("mine").unwrap());
        assert!(!state.is_responsible("theirs").unwrap());
        assert_eq!(
            state.own_range().unwrap(),
            Some(RingRange::new(91, 40, 99))
        );
        assert!(state.set_metadata("garbage").is_err());
    }

    #[test]
    fn test_replica_targets_only_for_owned_keys() {
        let hasher = DebugHash::new(99)
            .with_node(&me(), 40)
            .with_node(&NodeId::new("127.0.0.1", 5001), 70)
            .with_node(&NodeId::new("127.0.0.1", 5002), 90);
        let state = ServerState::new(me(), Arc::new(hasher)).with_replicas(1);
        let previous = state
            .set_metadata("28,5b,127.0.0.1:5000;46,29,127.0.0.1:5001;5a,47,127.0.0.1:5002;")
            .unwrap();
        assert!(previous.is_empty());

        assert_eq!(
            state.replica_targets("20").unwrap(),
            vec![NodeId::new("127.0.0.1", 5001)]
        );
        assert!(state.replica_targets("80").unwrap().is_empty());
        assert!(state.is_read_responsible("80").unwrap());
        assert!(!state.is_read_responsible("60").unwrap());
        assert_eq!(
            state.read_metadata().unwrap(),
            "28,47,127.0.0.1:5000;46,5b,127.0.0.1:5001;5a,29,127.0.0.1:5002;"
        );
    }
}
