//! Client that routes requests to the responsible server.
//!
//! The client keeps its own copy of the ring. Redirects refresh that copy
//! and retry at once; write-locked and stopped servers are retried with
//! exponential backoff until the attempt budget runs out.

use crate::config::RetryPolicy;
use crate::protocol::{KvMessage, StatusType};
use crate::transport::{Connector, TcpConnector, Transport};
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::{HashRing, Md5Hash, SharedHasher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cluster client
pub struct KvClient {
    bootstrap: NodeId,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    ring: HashRing<SharedHasher>,
    connections: HashMap<NodeId, Box<dyn Transport>>,
}

impl KvClient {
    /// Client that learns the ring from `bootstrap`
    pub fn new(bootstrap: NodeId) -> Self {
        Self::with_parts(
            bootstrap,
            Arc::new(Md5Hash),
            Arc::new(TcpConnector::new(Some(Duration::from_secs(10)))),
            RetryPolicy::default(),
        )
    }

    pub fn with_parts(
        bootstrap: NodeId,
        hasher: SharedHasher,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            bootstrap,
            connector,
            policy,
            ring: HashRing::with_hasher(hasher),
            connections: HashMap::new(),
        }
    }

    /// The client's current view of the ring
    pub fn ring(&self) -> &HashRing<SharedHasher> {
        &self.ring
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let reply = self.execute(KvMessage::with_key(StatusType::Get, key)).await?;
        match reply.status() {
            StatusType::GetSuccess => Ok(Some(reply.value().unwrap_or_default().to_string())),
            StatusType::GetError => Ok(None),
            _ => Err(unexpected(StatusType::GetSuccess, &reply)),
        }
    }

    /// Store `value`, returning `PutSuccess` for new keys and `PutUpdate` otherwise
    pub async fn put(&mut self, key: &str, value: &str) -> Result<StatusType> {
        let reply = self
            .execute(KvMessage::with_value(StatusType::Put, key, value))
            .await?;
        if reply.status().is_stored() {
            Ok(reply.status())
        } else {
            Err(unexpected(StatusType::PutSuccess, &reply))
        }
    }

    /// Remove `key`, returning whether it existed
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let reply = self.execute(KvMessage::with_key(StatusType::Delete, key)).await?;
        match reply.status() {
            StatusType::DeleteSuccess => Ok(true),
            StatusType::DeleteError => Ok(false),
            _ => Err(unexpected(StatusType::DeleteSuccess, &reply)),
        }
    }

    /// Reload the ring from the bootstrap node or any known member
    pub async fn refresh_ring(&mut self) -> Result<()> {
        let mut candidates = vec![self.bootstrap.clone()];
        candidates.extend(self.ring.nodes().filter(|node| **node != self.bootstrap).cloned());

        for node in candidates {
            let reply = match self.send_to(&node, &KvMessage::new(StatusType::Keyrange)).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(node = %node, error = %e, "Metadata source unreachable");
                    continue;
                }
            };
            if reply.status() == StatusType::KeyrangeSuccess && self.adopt(reply.key()) {
                return Ok(());
            }
        }
        Err(Error::Communication(
            "No server returned ring metadata".to_string(),
        ))
    }

    /// Read arcs of every member, as reported by the bootstrap node
    pub async fn read_ranges(&mut self) -> Result<String> {
        let node = self.bootstrap.clone();
        let reply = self
            .send_to(&node, &KvMessage::new(StatusType::KeyrangeRead))
            .await?;
        match reply.status() {
            StatusType::KeyrangeReadSuccess => Ok(reply.key().unwrap_or_default().to_string()),
            _ => Err(unexpected(StatusType::KeyrangeReadSuccess, &reply)),
        }
    }

    /// Replace the ring from wire metadata; returns whether it parsed
    fn adopt(&mut self, metadata: Option<&str>) -> bool {
        let Some(metadata) = metadata else {
            return false;
        };
        match HashRing::parse(metadata, self.ring.hasher().clone()) {
            Ok(ring) => {
                debug!(members = ring.len(), "Adopted ring metadata");
                self.ring = ring;
                true
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed ring metadata");
                false
            }
        }
    }

    async fn execute(&mut self, request: KvMessage) -> Result<KvMessage> {
        let key = request.require_key()?.to_string();
        let mut retries = 0u32;
        let mut last_failure = String::from("no attempt made");

        for attempt in 0..self.policy.max_attempts {
            let target = self
                .ring
                .responsible_node(&key)
                .cloned()
                .unwrap_or_else(|| self.bootstrap.clone());

            let backoff = match self.send_to(&target, &request).await {
                Ok(reply) => match reply.status() {
                    StatusType::ServerNotResponsible => {
                        if !self.adopt(reply.key()) {
                            let _ = self.refresh_ring().await;
                        }
                        last_failure = reply.to_string();
                        false
                    }
                    StatusType::ServerWriteLock => {
                        last_failure = reply.to_string();
                        true
                    }
                    StatusType::ServerStopped => {
                        let _ = self.refresh_ring().await;
                        last_failure = reply.to_string();
                        true
                    }
                    _ => return Ok(reply),
                },
                Err(e) => {
                    warn!(node = %target, attempt, error = %e, "Request failed");
                    let _ = self.refresh_ring().await;
                    last_failure = e.to_string();
                    true
                }
            };

            if backoff && attempt + 1 < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(retries)).await;
                retries += 1;
            }
        }

        Err(Error::Communication(format!(
            "Giving up on '{}' after {} attempts, last: {}",
            key, self.policy.max_attempts, last_failure
        )))
    }

    async fn send_to(&mut self, node: &NodeId, request: &KvMessage) -> Result<KvMessage> {
        if !self.connections.contains_key(node) {
            let connection = self.connector.connect(node).await?;
            self.connections.insert(node.clone(), connection);
        }
        let connection = self
            .connections
            .get_mut(node)
            .ok_or_else(|| Error::Communication(format!("No connection to {}", node)))?;

        let reply = connection.request(request).await;
        if reply.is_err() {
            // Reconnect on the next use.
            self.connections.remove(node);
        }
        reply
    }
}

fn unexpected(expected: StatusType, reply: &KvMessage) -> Error {
    Error::UnexpectedPeerResponse {
        expected: expected.to_string(),
        received: reply.to_string(),
    }
}
