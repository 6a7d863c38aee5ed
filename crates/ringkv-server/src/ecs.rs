//! Coordinator (ECS): ring membership, handoff orchestration and heartbeats.
//!
//! Every membership change runs under one ring-wide lock. Joining moves the
//! new node's arc off its successor; leaving moves the whole arc of the
//! departing node onto its successor. Servers that miss a heartbeat are
//! dropped without a handoff.

use crate::config::CoordinatorConfig;
use crate::protocol::{KvMessage, StatusType};
use crate::transport::{Connector, TcpConnector, TcpTransport, Transport};
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::hashing::to_hex_prefixed;
use ringkv_ring::{HashRing, Md5Hash, RingRange, SharedHasher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// External configuration service
pub struct Coordinator {
    config: CoordinatorConfig,
    ring: Mutex<HashRing<SharedHasher>>,
    connector: Arc<dyn Connector>,
    heartbeats: std::sync::Mutex<HashMap<NodeId, JoinHandle<()>>>,
}

impl Coordinator {
    /// Coordinator placing nodes with MD5 and talking TCP
    pub fn new(config: CoordinatorConfig) -> Self {
        // Handoffs may run long; heartbeats carry their own timeout.
        let connector = Arc::new(TcpConnector::new(None));
        Self::with_parts(config, Arc::new(Md5Hash), connector)
    }

    pub fn with_parts(
        config: CoordinatorConfig,
        hasher: SharedHasher,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            ring: Mutex::new(HashRing::with_hasher(hasher)),
            connector,
            heartbeats: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the current membership
    pub async fn ring(&self) -> HashRing<SharedHasher> {
        self.ring.lock().await.clone()
    }

    /// Admit `node`, moving the arc it takes over off its successor
    pub async fn add_server(&self, node: NodeId) -> Result<()> {
        let mut ring = self.ring.lock().await;
        if ring.contains(&node) {
            return Err(Error::InvalidOperation(format!("{} is already a member", node)));
        }
        let mut updated = ring.clone();
        let position = updated.add_node(node.clone())?;
        info!(node = %node, position = %to_hex_prefixed(position), "Adding server");

        self.set_keyrange(&node, &updated).await?;

        let Some(successor) = updated.succeeding_node(&node).cloned() else {
            *ring = updated;
            info!(node = %node, "First server owns the whole ring");
            return Ok(());
        };

        let ceded = ring.ceded_ranges(&updated, &successor);
        let mut connection = self.open(&successor).await?;
        let moved = async {
            exchange(
                connection.as_mut(),
                KvMessage::new(StatusType::EcsWriteLock),
                StatusType::ServerWriteLock,
            )
            .await?;
            for range in &ceded {
                run_handoff(connection.as_mut(), range, &node).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = moved {
            error!(node = %node, successor = %successor, error = %e, "Join aborted");
            if let Err(unlock) = exchange(
                connection.as_mut(),
                KvMessage::new(StatusType::EcsWriteUnlock),
                StatusType::ServerWriteUnlock,
            )
            .await
            {
                warn!(successor = %successor, error = %unlock, "Could not unlock successor");
            }
            return Err(e);
        }

        // Committed: from here on failures are left to the heartbeats.
        *ring = updated;
        self.broadcast(&ring).await;
        if let Err(e) = exchange(
            connection.as_mut(),
            KvMessage::new(StatusType::EcsWriteUnlock),
            StatusType::ServerWriteUnlock,
        )
        .await
        {
            warn!(successor = %successor, error = %e, "Could not unlock successor");
        }
        let _ = connection.disconnect().await;

        info!(node = %node, members = ring.len(), "Server added");
        Ok(())
    }

    /// Graceful leave: move the whole arc of `node` to its successor first.
    ///
    /// The node stays a monitored member until the handoff has finished; on
    /// failure the ring is left unchanged.
    pub async fn remove_server_with_handoff(&self, node: &NodeId) -> Result<()> {
        let mut ring = self.ring.lock().await;
        let range = ring
            .range_of(node)
            .ok_or_else(|| Error::NotInRing(node.clone()))?;
        let mut updated = ring.clone();
        updated.remove_node(node)?;

        let Some(successor) = ring.succeeding_node(node).cloned() else {
            *ring = updated;
            self.stop_heartbeat(node);
            warn!(node = %node, "Last server left; its data stays on its disk");
            return Ok(());
        };
        info!(node = %node, successor = %successor, "Removing server with handoff");

        let moved = async {
            self.set_keyrange(&successor, &updated).await?;
            let mut connection = self.open(node).await?;
            exchange(
                connection.as_mut(),
                KvMessage::new(StatusType::EcsWriteLock),
                StatusType::ServerWriteLock,
            )
            .await?;
            run_handoff(connection.as_mut(), &range, &successor).await?;
            let _ = connection.disconnect().await;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = moved {
            error!(node = %node, error = %e, "Leave aborted");
            // Old metadata for every member; this also lifts the leaving node's write lock.
            self.broadcast(&ring).await;
            return Err(e);
        }

        *ring = updated;
        self.stop_heartbeat(node);
        self.broadcast(&ring).await;
        info!(node = %node, members = ring.len(), "Server removed");
        Ok(())
    }

    /// Drop a failed server without a handoff
    pub async fn remove_server(&self, node: &NodeId) -> Result<()> {
        let mut ring = self.ring.lock().await;
        ring.remove_node(node)?;
        self.stop_heartbeat(node);
        warn!(node = %node, members = ring.len(), "Server dropped; data it held is unavailable");
        self.broadcast(&ring).await;
        Ok(())
    }

    /// Ping `node` every heartbeat interval, dropping it on the first miss
    pub fn spawn_heartbeat(self: &Arc<Self>, node: NodeId) {
        let coordinator = Arc::clone(self);
        let target = node.clone();
        let handle = tokio::spawn(async move { coordinator.heartbeat_loop(target).await });
        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            if let Some(previous) = heartbeats.insert(node, handle) {
                previous.abort();
            }
        }
    }

    fn stop_heartbeat(&self, node: &NodeId) {
        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            if let Some(handle) = heartbeats.remove(node) {
                handle.abort();
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, node: NodeId) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let beat = tokio::time::timeout(self.config.heartbeat_timeout, self.ping(&node)).await;
            let failure = match beat {
                Ok(Ok(())) => {
                    trace!(node = %node, "Heartbeat");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => Error::NoAckReceived,
            };

            warn!(node = %node, error = %failure, "Heartbeat missed");
            // Detach this task first so removal does not abort it midway.
            if let Ok(mut heartbeats) = self.heartbeats.lock() {
                heartbeats.remove(&node);
            }
            match self.remove_server(&node).await {
                Ok(()) | Err(Error::NotInRing(_)) => {}
                Err(e) => error!(node = %node, error = %e, "Could not drop server"),
            }
            return;
        }
    }

    async fn ping(&self, node: &NodeId) -> Result<()> {
        let mut connection = self.connector.connect(node).await?;
        exchange(
            connection.as_mut(),
            KvMessage::new(StatusType::EcsHeartBeat),
            StatusType::ServerHeartBeat,
        )
        .await?;
        let _ = connection.disconnect().await;
        Ok(())
    }

    async fn open(&self, node: &NodeId) -> Result<Box<dyn Transport>> {
        self.connector
            .connect(node)
            .await
            .map_err(|e| Error::HandoffFailure(format!("Could not reach {}: {}", node, e)))
    }

    async fn set_keyrange(&self, node: &NodeId, ring: &HashRing<SharedHasher>) -> Result<()> {
        let mut connection = self.connector.connect(node).await?;
        exchange(
            connection.as_mut(),
            KvMessage::with_key(StatusType::EcsSetKeyrange, ring.serialize()),
            StatusType::ServerAck,
        )
        .await?;
        let _ = connection.disconnect().await;
        Ok(())
    }

    /// Send `ring` to every member; unreachable members are left to the heartbeat
    async fn broadcast(&self, ring: &HashRing<SharedHasher>) {
        for node in ring.nodes() {
            if let Err(e) = self.set_keyrange(node, ring).await {
                warn!(node = %node, error = %e, "Metadata update failed");
            }
        }
    }

    /// Accept `server_start`/`server_shutdown` requests until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Coordinator listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.serve_connection(stream).await {
                            debug!(peer = %addr, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut connection = TcpTransport::new(stream, None);
        while let Some(line) = connection.read_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match KvMessage::parse(&line) {
                Ok(message) => self.handle(&message).await,
                Err(e) => {
                    debug!(line, error = %e, "Rejected malformed message");
                    KvMessage::new(StatusType::Error)
                }
            };
            connection.send(&reply).await?;
        }
        Ok(())
    }

    async fn handle(self: &Arc<Self>, message: &KvMessage) -> KvMessage {
        let result = match message.status() {
            StatusType::ServerStart => match sender(message) {
                Ok(node) => self
                    .add_server(node.clone())
                    .await
                    .map(|()| self.spawn_heartbeat(node)),
                Err(e) => Err(e),
            },
            StatusType::ServerShutdown => match sender(message) {
                Ok(node) => self.remove_server_with_handoff(&node).await,
                Err(e) => Err(e),
            },
            other => Err(Error::InvalidOperation(format!(
                "Coordinator does not handle '{}'",
                other
            ))),
        };

        match result {
            Ok(()) => KvMessage::new(StatusType::EcsAck),
            Err(e) => {
                error!(request = %message, error = %e, "Request failed");
                KvMessage::new(StatusType::Error)
            }
        }
    }
}

/// Node named by `<status> <address> <port>`
fn sender(message: &KvMessage) -> Result<NodeId> {
    let address = message.require_key()?;
    let port = message
        .require_value()?
        .trim()
        .parse::<u16>()
        .map_err(|e| Error::MalformedMessage(format!("Invalid port: {}", e)))?;
    Ok(NodeId::new(address, port))
}

/// Send `request` and require a reply with status `expected`
async fn exchange(
    connection: &mut dyn Transport,
    request: KvMessage,
    expected: StatusType,
) -> Result<()> {
    let reply = connection.request(&request).await.map_err(|e| {
        debug!(request = %request, error = %e, "No reply");
        match e {
            Error::Communication(_) | Error::Io(_) => Error::NoAckReceived,
            other => other,
        }
    })?;
    if reply.status() == expected {
        Ok(())
    } else {
        Err(Error::UnexpectedPeerResponse {
            expected: expected.to_string(),
            received: reply.to_string(),
        })
    }
}

/// Ask the server on `connection` to move `range` to `destination` and wait for it
async fn run_handoff(
    connection: &mut dyn Transport,
    range: &RingRange,
    destination: &NodeId,
) -> Result<()> {
    let bounds = format!(
        "{} {}",
        to_hex_prefixed(range.start()),
        to_hex_prefixed(range.end())
    );
    exchange(
        connection,
        KvMessage::with_value(StatusType::EcsHandoff, destination.to_string(), bounds),
        StatusType::ServerAck,
    )
    .await?;
    exchange(
        connection,
        KvMessage::new(StatusType::EcsWaitingForHandoff),
        StatusType::ServerHandoffSuccess,
    )
    .await
}
