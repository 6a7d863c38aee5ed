//! Migration of a hash range to another server.
//!
//! Pairs go out one `put_server` at a time. A pair is deleted locally only
//! after the destination acknowledged storing it; anything else stays on
//! this node and moves with the next handoff of the same range.

use crate::kv::{blocking, KvStore};
use crate::protocol::{KvMessage, StatusType};
use crate::transport::Connector;
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::RingRange;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffReport {
    /// Keys stored by the destination and removed here
    pub transferred: Vec<String>,
    /// Keys still held here
    pub retained: Vec<String>,
}

impl HandoffReport {
    /// Whether every key in the range moved
    pub fn is_complete(&self) -> bool {
        self.retained.is_empty()
    }
}

/// Handle of a migration running in the background
pub type HandoffHandle = JoinHandle<Result<HandoffReport>>;

/// Moves ranges of a [`KvStore`] to peers.
#[derive(Clone)]
pub struct HandoffCoordinator {
    store: KvStore,
    connector: Arc<dyn Connector>,
}

impl HandoffCoordinator {
    pub fn new(store: KvStore, connector: Arc<dyn Connector>) -> Self {
        Self { store, connector }
    }

    /// Run a migration as its own task
    pub fn spawn(&self, range: RingRange, destination: NodeId) -> HandoffHandle {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.migrate(range, &destination).await })
    }

    /// Move every pair whose key hashes into `range` to `destination`.
    ///
    /// Fails with [`Error::HandoffFailure`] before anything is sent if the
    /// destination is unreachable or the range cannot be read. Failures of
    /// single keys are reported, not returned.
    pub async fn migrate(&self, range: RingRange, destination: &NodeId) -> Result<HandoffReport> {
        info!(range = %range, destination = %destination, "Starting handoff");

        let mut connection = self.connector.connect(destination).await.map_err(|e| {
            error!(destination = %destination, error = %e, "Handoff aborted");
            Error::HandoffFailure(format!("Could not connect to {}: {}", destination, e))
        })?;

        let store = self.store.clone();
        let pairs = blocking(move || store.scan_hash_range(&range))
            .await
            .map_err(|e| Error::HandoffFailure(format!("Could not read range {}: {}", range, e)))?;

        let mut report = HandoffReport::default();
        for (key, value) in pairs {
            let request = KvMessage::with_value(StatusType::PutServer, key.as_str(), value);
            let outcome = match connection.request(&request).await {
                Ok(reply) if reply.status().is_stored() => Ok(()),
                Ok(reply) => Err(Error::UnexpectedPeerResponse {
                    expected: StatusType::PutSuccess.to_string(),
                    received: reply.to_string(),
                }),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    let store = self.store.clone();
                    let removed_key = key.clone();
                    match blocking(move || store.delete(&removed_key)).await {
                        Ok(_) => {
                            debug!(key = %key, destination = %destination, "Key handed off");
                            report.transferred.push(key);
                        }
                        Err(e) => {
                            // The destination holds a copy; the next handoff overwrites it.
                            warn!(key = %key, error = %e, "Transferred key could not be removed");
                            report.retained.push(key);
                        }
                    }
                }
                Err(reason) => {
                    let failure = Error::KeyTransferFailure {
                        key: key.clone(),
                        reason: reason.to_string(),
                    };
                    warn!(destination = %destination, error = %failure, "Keeping key");
                    report.retained.push(key);
                }
            }
        }

        if let Err(e) = connection.disconnect().await {
            debug!(destination = %destination, error = %e, "Disconnect after handoff failed");
        }
        info!(
            destination = %destination,
            transferred = report.transferred.len(),
            retained = report.retained.len(),
            "Handoff finished"
        );
        Ok(report)
    }
}
