//! # RingKV
//!
//! A distributed key-value store. Servers each own an arc of a consistent
//! hash ring and keep their keys in a disk-backed B-tree. A coordinator
//! tracks membership and moves data between servers whenever a server
//! joins or leaves.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ringkv::{KvServer, ServerConfig, NodeId};
//!
//! #[tokio::main]
//! async fn main() -> ringkv::Result<()> {
//!     // A standalone server owns the whole ring.
//!     let config = ServerConfig::new(NodeId::new("127.0.0.1", 5153), "./data");
//!     let server = KvServer::bind(config).await?;
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```
//!
//! Talking to a cluster:
//!
//! ```rust,no_run
//! use ringkv::{KvClient, NodeId};
//!
//! # async fn demo() -> ringkv::Result<()> {
//! let mut client = KvClient::new(NodeId::new("127.0.0.1", 5153));
//! client.put("user:1", "Alice").await?;
//! assert_eq!(client.get("user:1").await?, Some("Alice".to_string()));
//! client.delete("user:1").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire protocol
//!
//! One message per line, `<status> [key] [value]`. Clients send `get`, `put`,
//! `delete`, `keyrange` and `keyrange_read`; a server that does not own a key
//! answers `server_not_responsible <metadata>` and the client retries at the
//! owner. Reads are also served by the owner's replicas once the ring is
//! large enough to replicate.

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod ecs;
pub mod handoff;
pub mod kv;
pub mod logging;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod state;
pub mod transport;

// Re-export core types
pub use ringkv_core::{Error, NodeId, Result};

// Ring components
pub use ringkv_ring::{DebugHash, HashAlgorithm, HashRing, Md5Hash, RingRange, SharedHasher};

// Storage components
pub use ringkv_storage::{StorageConfig, StorageEngine, StorageStats, SyncMode};

pub use auth::PeerType;
pub use client::KvClient;
pub use config::{CoordinatorConfig, HandoffMode, RetryPolicy, ServerConfig};
pub use dispatcher::Dispatcher;
pub use ecs::Coordinator;
pub use handoff::{HandoffCoordinator, HandoffHandle, HandoffReport};
pub use kv::{KvStore, PutOutcome};
pub use protocol::{KvMessage, StatusType};
pub use replication::{ReplicationReport, Replicator};
pub use server::KvServer;
pub use state::{NodeState, ServerState, DEFAULT_REPLICAS};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
