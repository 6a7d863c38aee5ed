//! Configuration for servers, the coordinator and clients.

use crate::state::DEFAULT_REPLICAS;
use rand::Rng;
use ringkv_core::NodeId;
use ringkv_storage::StorageConfig;
use std::path::PathBuf;
use std::time::Duration;

/// How a server runs peer transfers: migrations requested by the
/// coordinator and replica updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    /// Spawn a task and acknowledge immediately (default)
    Background,
    /// Finish the transfer before acknowledging
    Inline,
}

/// Key-value server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the server listens on and advertises to the ring
    pub listen: NodeId,
    /// Coordinator to register with on startup
    pub coordinator: Option<NodeId>,
    /// Directory holding the B-tree store
    pub data_dir: PathBuf,
    /// Storage engine options
    pub storage: StorageConfig,
    /// Migration scheduling
    pub handoff_mode: HandoffMode,
    /// Extra copies of every key kept on the owner's successors
    pub replicas: usize,
    /// Read timeout on connections the server opens to peers
    pub peer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: NodeId::new("127.0.0.1", 5153),
            coordinator: None,
            data_dir: PathBuf::from("data"),
            storage: StorageConfig::default(),
            handoff_mode: HandoffMode::Background,
            replicas: DEFAULT_REPLICAS,
            peer_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Server listening on `listen` and storing under `data_dir`
    pub fn new(listen: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Register with a coordinator on startup
    pub fn with_coordinator(mut self, coordinator: NodeId) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Set the migration scheduling
    pub fn with_handoff_mode(mut self, mode: HandoffMode) -> Self {
        self.handoff_mode = mode;
        self
    }

    /// Keep `replicas` extra copies of every key; `0` disables replication
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the storage engine options
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }
}

/// Coordinator (ECS) configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the coordinator listens on for `server_start`/`server_shutdown`
    pub listen: NodeId,
    /// Time between two heartbeats to the same server
    pub heartbeat_interval: Duration,
    /// A server that does not answer a heartbeat within this time is removed
    pub heartbeat_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: NodeId::new("127.0.0.1", 5152),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Client retry behaviour for transient server statuses
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Relative jitter, `0.5` spreads delays over `[0.5, 1.5]` times the base
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests and tools
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (zero-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(retry as i32);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}
