//! Routes parsed messages into storage, the state machine and handoff.

use crate::auth::PeerType;
use crate::config::HandoffMode;
use crate::handoff::{HandoffCoordinator, HandoffHandle};
use crate::kv::{blocking, KvStore, PutOutcome};
use crate::protocol::{KvMessage, StatusType};
use crate::replication::Replicator;
use crate::state::{NodeState, ServerState};
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::hashing::parse_hex;
use ringkv_ring::{HashAlgorithm, HashRing, RingRange, SharedHasher};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Answers every message a server receives.
pub struct Dispatcher {
    state: Arc<ServerState>,
    store: KvStore,
    handoff: HandoffCoordinator,
    replicator: Replicator,
    mode: HandoffMode,
    pending: Mutex<Option<HandoffHandle>>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<ServerState>,
        store: KvStore,
        handoff: HandoffCoordinator,
        replicator: Replicator,
        mode: HandoffMode,
    ) -> Self {
        Self {
            state,
            store,
            handoff,
            replicator,
            mode,
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Answer one raw line
    pub async fn dispatch_line(&self, line: &str) -> KvMessage {
        match KvMessage::parse(line) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                debug!(line, error = %e, "Rejected malformed message");
                KvMessage::new(StatusType::Error)
            }
        }
    }

    /// Answer one message
    pub async fn dispatch(&self, message: KvMessage) -> KvMessage {
        let status = message.status();
        let reply = match self.route(&message).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(request = %message, error = %e, "Request failed");
                failure_reply(&message)
            }
        };
        if status != StatusType::EcsHeartBeat {
            info!(request = %message, reply = %reply, "Processed");
        }
        reply
    }

    async fn route(&self, message: &KvMessage) -> Result<KvMessage> {
        let peer = PeerType::of(message.status());
        if self.state.state()? == NodeState::Stopped && !peer.bypasses_stop() {
            return Ok(KvMessage::new(StatusType::ServerStopped));
        }

        match message.status() {
            StatusType::Get => self.get(message.require_key()?).await,
            StatusType::Put => self.put(message.require_key()?, message.value()).await,
            StatusType::Delete => self.put(message.require_key()?, None).await,
            StatusType::Keyrange => Ok(metadata_reply(
                StatusType::KeyrangeSuccess,
                self.state.metadata()?,
            )),
            StatusType::KeyrangeRead => Ok(metadata_reply(
                StatusType::KeyrangeReadSuccess,
                self.state.read_metadata()?,
            )),
            StatusType::PutServer => self.write(message.require_key()?, message.value()).await,
            StatusType::EcsWriteLock => {
                self.state.write_lock()?;
                Ok(KvMessage::new(StatusType::ServerWriteLock))
            }
            StatusType::EcsWriteUnlock => {
                self.state.unlock()?;
                Ok(KvMessage::new(StatusType::ServerWriteUnlock))
            }
            StatusType::EcsSetKeyrange => {
                let previous = self.state.set_metadata(message.require_key()?)?;
                self.state.start()?;
                self.rebalance(previous).await?;
                Ok(KvMessage::new(StatusType::ServerAck))
            }
            StatusType::EcsHandoff => self.start_handoff(message).await,
            StatusType::EcsWaitingForHandoff => self.await_handoff().await,
            StatusType::EcsHeartBeat => Ok(KvMessage::new(StatusType::ServerHeartBeat)),
            other => Err(Error::InvalidOperation(format!(
                "'{}' is not a request",
                other
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<KvMessage> {
        if !self.state.is_read_responsible(key)? {
            return self.not_responsible();
        }
        let store = self.store.clone();
        let lookup = key.to_string();
        match blocking(move || store.get(&lookup)).await {
            Ok(Some(value)) => Ok(KvMessage::with_value(StatusType::GetSuccess, key, value)),
            Ok(None) => Ok(KvMessage::with_key(StatusType::GetError, key)),
            Err(e) => {
                error!(key, error = %e, "Read failed");
                Ok(KvMessage::with_key(StatusType::GetError, key))
            }
        }
    }

    async fn put(&self, key: &str, value: Option<&str>) -> Result<KvMessage> {
        if !self.state.is_responsible(key)? {
            return self.not_responsible();
        }
        if !self.state.can_write()? {
            return Ok(KvMessage::new(StatusType::ServerWriteLock));
        }
        self.write(key, value).await
    }

    /// Apply a write and forward it to the replicas if this node owns `key`
    async fn write(&self, key: &str, value: Option<&str>) -> Result<KvMessage> {
        let reply = self.store_unchecked(key, value).await?;
        if matches!(
            reply.status(),
            StatusType::PutSuccess | StatusType::PutUpdate | StatusType::DeleteSuccess
        ) {
            self.replicate(key, value.filter(|value| !value.is_empty()))
                .await?;
        }
        Ok(reply)
    }

    async fn replicate(&self, key: &str, value: Option<&str>) -> Result<()> {
        let targets = self.state.replica_targets(key)?;
        if targets.is_empty() {
            return Ok(());
        }
        let replicator = self.replicator.clone();
        let key = key.to_string();
        let value = value.map(str::to_string);
        self.schedule(async move {
            let report = replicator.forward(&targets, &key, value.as_deref()).await;
            if report.failed > 0 {
                warn!(key = %key, failed = report.failed, "Replicas missed a write");
            }
        })
        .await;
        Ok(())
    }

    async fn rebalance(&self, previous: HashRing<SharedHasher>) -> Result<()> {
        let current = self.state.ring()?;
        let replicas = self.state.replicas();
        let replicator = self.replicator.clone();
        self.schedule(async move {
            if let Err(e) = replicator.rebalance(&previous, &current, replicas).await {
                error!(error = %e, "Replica rebalance failed");
            }
        })
        .await;
        Ok(())
    }

    /// Run peer traffic the way migrations run: as a task, or before replying
    async fn schedule(&self, work: impl Future<Output = ()> + Send + 'static) {
        match self.mode {
            HandoffMode::Background => {
                tokio::spawn(work);
            }
            HandoffMode::Inline => work.await,
        }
    }

    /// Apply a put or delete without responsibility or lock checks
    async fn store_unchecked(&self, key: &str, value: Option<&str>) -> Result<KvMessage> {
        let store = self.store.clone();
        let owned_key = key.to_string();
        let owned_value = value.map(str::to_string);
        let result = blocking(move || store.put(&owned_key, owned_value.as_deref())).await;

        Ok(match result {
            Ok(PutOutcome::Inserted) => KvMessage::with_key(StatusType::PutSuccess, key),
            Ok(PutOutcome::Updated) => KvMessage::with_key(StatusType::PutUpdate, key),
            Ok(PutOutcome::Deleted) => KvMessage::with_key(StatusType::DeleteSuccess, key),
            Ok(PutOutcome::Absent) => KvMessage::with_key(StatusType::DeleteError, key),
            Err(e) => {
                error!(key, error = %e, "Write failed");
                match value.filter(|value| !value.is_empty()) {
                    Some(value) => KvMessage::with_value(StatusType::PutError, key, value),
                    None => KvMessage::with_key(StatusType::DeleteError, key),
                }
            }
        })
    }

    fn not_responsible(&self) -> Result<KvMessage> {
        Ok(metadata_reply(
            StatusType::ServerNotResponsible,
            self.state.metadata()?,
        ))
    }

    async fn start_handoff(&self, message: &KvMessage) -> Result<KvMessage> {
        let destination: NodeId = message.require_key()?.parse()?;
        let bounds: Vec<&str> = message.require_value()?.split_whitespace().collect();
        let [lower, upper] = bounds.as_slice() else {
            return Err(Error::MalformedMessage(format!(
                "Handoff needs two bounds, got '{}'",
                message.require_value()?
            )));
        };
        let max = self.store.hasher().max();
        let (lower, upper) = (parse_hex(lower)?, parse_hex(upper)?);
        if lower > max || upper > max {
            return Err(Error::MalformedMessage(format!(
                "Handoff bounds {:x} {:x} exceed the hash space",
                lower, upper
            )));
        }
        let range = RingRange::new(lower, upper, max);

        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::InvalidOperation(
                "A handoff is already running".to_string(),
            ));
        }

        match self.mode {
            HandoffMode::Background => {
                *pending = Some(self.handoff.spawn(range, destination));
            }
            HandoffMode::Inline => {
                *pending = None;
                let report = self.handoff.migrate(range, &destination).await?;
                if !report.is_complete() {
                    warn!(retained = report.retained.len(), "Handoff left keys behind");
                }
            }
        }
        Ok(KvMessage::new(StatusType::ServerAck))
    }

    async fn await_handoff(&self) -> Result<KvMessage> {
        let handle = self.pending.lock().await.take();
        if let Some(handle) = handle {
            let report = handle
                .await
                .map_err(|e| Error::HandoffFailure(format!("Handoff task failed: {}", e)))??;
            if !report.is_complete() {
                warn!(retained = report.retained.len(), "Handoff left keys behind");
            }
        }
        Ok(KvMessage::new(StatusType::ServerHandoffSuccess))
    }
}

fn metadata_reply(status: StatusType, metadata: String) -> KvMessage {
    if metadata.is_empty() {
        KvMessage::new(status)
    } else {
        KvMessage::with_key(status, metadata)
    }
}

/// Status a client sees when its request failed internally
fn failure_reply(request: &KvMessage) -> KvMessage {
    match (request.status(), request.key()) {
        (StatusType::Get, Some(key)) => KvMessage::with_key(StatusType::GetError, key),
        (StatusType::Put | StatusType::PutServer, Some(key)) => {
            KvMessage::with_key(StatusType::PutError, key)
        }
        (StatusType::Delete, Some(key)) => KvMessage::with_key(StatusType::DeleteError, key),
        _ => KvMessage::new(StatusType::Error),
    }
}
