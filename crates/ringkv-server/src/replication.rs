//! Successor replication.
//!
//! With `replicas = n`, every pair lives on its owner and on the `n`
//! members clockwise of it once the ring has more than `n` members. Owners
//! forward each write to those replicas with `put_server`. On a ring change
//! every node pushes its arc to replicas that did not hold it yet and drops
//! copies it no longer serves reads for. Replica traffic is best effort:
//! failures are logged and the next ring change pushes the arc again.

use crate::kv::{blocking, KvStore};
use crate::protocol::{KvMessage, StatusType};
use crate::transport::Connector;
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::{HashRing, RingRange, SharedHasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one round of replica traffic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Copies acknowledged by a replica
    pub sent: usize,
    /// Copies a replica did not acknowledge
    pub failed: usize,
    /// Local copies removed because this node no longer reads for them
    pub dropped: usize,
}

impl ReplicationReport {
    fn absorb(&mut self, other: ReplicationReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.dropped += other.dropped;
    }
}

/// Keeps the replicas of one node's arc up to date.
#[derive(Clone)]
pub struct Replicator {
    me: NodeId,
    store: KvStore,
    connector: Arc<dyn Connector>,
}

impl Replicator {
    pub fn new(me: NodeId, store: KvStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            me,
            store,
            connector,
        }
    }

    /// Forward one write to `targets`; `None` forwards a delete
    pub async fn forward(
        &self,
        targets: &[NodeId],
        key: &str,
        value: Option<&str>,
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        let pair = [(key.to_string(), value.map(str::to_string))];
        for target in targets {
            report.absorb(self.push(target, &pair).await);
        }
        report
    }

    /// Bring replicas in line after the ring moved from `old` to `new`.
    ///
    /// Replicas new to this node receive its whole arc, replicas it kept
    /// receive only the part of the arc it gained. An unchanged ring resends
    /// the whole arc to every replica. Copies outside the new
    /// read arc are deleted locally. A node missing from `new` does nothing:
    /// whatever it holds still waits for a handoff.
    pub async fn rebalance(
        &self,
        old: &HashRing<SharedHasher>,
        new: &HashRing<SharedHasher>,
        replicas: usize,
    ) -> Result<ReplicationReport> {
        let mut report = ReplicationReport::default();
        let Some(own) = new.range_of(&self.me) else {
            return Ok(report);
        };
        let was_replicated = old.contains(&self.me) && old.is_replicated(replicas);
        // A ring delivered twice follows a handoff into this node, whose
        // source may also be one of its replicas. Resend the whole arc.
        let repeated = old == new;

        if new.is_replicated(replicas) {
            let kept: Vec<NodeId> = if was_replicated && !repeated {
                old.successors(&self.me, replicas).into_iter().cloned().collect()
            } else {
                Vec::new()
            };
            let previous = old.range_of(&self.me);

            for target in new.successors(&self.me, replicas) {
                let ranges = match (&previous, kept.contains(target)) {
                    (Some(before), true) => own.difference(before),
                    _ => vec![own],
                };
                for range in ranges {
                    let pairs = self.scan(range).await?;
                    if pairs.is_empty() {
                        continue;
                    }
                    info!(range = %range, replica = %target, pairs = pairs.len(), "Replicating arc");
                    let pairs: Vec<(String, Option<String>)> = pairs
                        .into_iter()
                        .map(|(key, value)| (key, Some(value)))
                        .collect();
                    report.absorb(self.push(target, &pairs).await);
                }
            }
        }

        if was_replicated {
            let readable = new.read_range_of(&self.me, replicas).unwrap_or(own);
            if let Some(before) = old.read_range_of(&self.me, replicas) {
                for stale in before.difference(&readable) {
                    report.dropped += self.drop_range(stale).await?;
                }
            }
        }

        if report != ReplicationReport::default() {
            info!(
                sent = report.sent,
                failed = report.failed,
                dropped = report.dropped,
                "Replicas rebalanced"
            );
        }
        Ok(report)
    }

    async fn scan(&self, range: RingRange) -> Result<Vec<(String, String)>> {
        let store = self.store.clone();
        blocking(move || store.scan_hash_range(&range)).await
    }

    /// Send each pair as `put_server`, counting acknowledged copies
    async fn push(
        &self,
        target: &NodeId,
        pairs: &[(String, Option<String>)],
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        let mut connection = match self.connector.connect(target).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(replica = %target, error = %e, "Replica unreachable");
                report.failed = pairs.len();
                return report;
            }
        };

        for (key, value) in pairs {
            let request = match value {
                Some(value) => KvMessage::with_value(StatusType::PutServer, key.as_str(), value),
                None => KvMessage::with_key(StatusType::PutServer, key.as_str()),
            };
            let outcome = match connection.request(&request).await {
                Ok(reply) if acknowledged(reply.status()) => Ok(()),
                Ok(reply) => Err(Error::UnexpectedPeerResponse {
                    expected: StatusType::PutSuccess.to_string(),
                    received: reply.to_string(),
                }),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    debug!(key = %key, replica = %target, delete = value.is_none(), "Replicated");
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(key = %key, replica = %target, error = %e, "Replica update failed");
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = connection.disconnect().await {
            debug!(replica = %target, error = %e, "Disconnect after replication failed");
        }
        report
    }

    async fn drop_range(&self, range: RingRange) -> Result<usize> {
        let store = self.store.clone();
        let dropped = blocking(move || {
            let mut dropped = 0;
            for (key, _) in store.scan_hash_range(&range)? {
                if store.delete(&key)? {
                    dropped += 1;
                }
            }
            Ok(dropped)
        })
        .await?;
        debug!(range = %range, dropped, "Dropped replica copies");
        Ok(dropped)
    }
}

/// A replica answers a forwarded delete of a missing key with `delete_error`
fn acknowledged(status: StatusType) -> bool {
    status.is_stored() || matches!(status, StatusType::DeleteSuccess | StatusType::DeleteError)
}
