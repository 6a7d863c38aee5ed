//! Key-value server: accept loop and lifecycle.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::handoff::HandoffCoordinator;
use crate::kv::{blocking, KvStore};
use crate::protocol::{KvMessage, StatusType};
use crate::replication::Replicator;
use crate::state::ServerState;
use crate::transport::{Connector, TcpConnector, TcpTransport, Transport, WELCOME_PREFIX};
use ringkv_core::{Error, NodeId, Result};
use ringkv_ring::{Md5Hash, SharedHasher};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A bound, not yet running key-value server
pub struct KvServer {
    config: ServerConfig,
    me: NodeId,
    listener: TcpListener,
    state: Arc<ServerState>,
    store: KvStore,
    dispatcher: Arc<Dispatcher>,
}

impl KvServer {
    /// Bind the listener and open storage, placing keys with MD5
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_hasher(config, Arc::new(Md5Hash)).await
    }

    /// Bind with a custom placement algorithm.
    ///
    /// Port `0` picks a free port; the node then advertises the port it got.
    pub async fn bind_with_hasher(config: ServerConfig, hasher: SharedHasher) -> Result<Self> {
        let listener = TcpListener::bind((config.listen.address(), config.listen.port())).await?;
        let me = NodeId::new(config.listen.address(), listener.local_addr()?.port());

        let store = {
            let dir = config.data_dir.clone();
            let storage = config.storage.clone();
            let hasher = hasher.clone();
            blocking(move || KvStore::open(dir, storage, hasher)).await?
        };

        let state = match config.coordinator {
            Some(_) => ServerState::new(me.clone(), hasher),
            None => ServerState::standalone(me.clone(), hasher)?,
        };
        let state = Arc::new(state.with_replicas(config.replicas));
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(Some(config.peer_timeout)));
        let handoff = HandoffCoordinator::new(store.clone(), Arc::clone(&connector));
        let replicator = Replicator::new(me.clone(), store.clone(), connector);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state),
            store.clone(),
            handoff,
            replicator,
            config.handoff_mode,
        ));

        info!(
            node = %me,
            data_dir = %config.data_dir.display(),
            keys = store.stats().element_count,
            "Server bound"
        );
        Ok(Self {
            config,
            me,
            listener,
            state,
            store,
            dispatcher,
        })
    }

    /// Address this server advertises
    pub fn node_id(&self) -> &NodeId {
        &self.me
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Serve until `shutdown` resolves.
    ///
    /// With a coordinator configured the server registers on startup and,
    /// on shutdown, waits until the coordinator has moved its data away.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let KvServer {
            config,
            me,
            listener,
            state,
            store,
            dispatcher,
        } = self;

        let accept = tokio::spawn(accept_loop(listener, dispatcher, me.clone()));

        if let Some(coordinator) = &config.coordinator {
            let registered = announce(
                coordinator,
                StatusType::ServerStart,
                &me,
                Some(config.peer_timeout),
            )
            .await;
            if let Err(e) = registered {
                error!(coordinator = %coordinator, error = %e, "Registration failed");
                accept.abort();
                return Err(e);
            }
            info!(node = %me, coordinator = %coordinator, "Registered with coordinator");
        }

        shutdown.await;
        info!(node = %me, "Shutting down");

        if let Some(coordinator) = &config.coordinator {
            // No timeout: the coordinator answers after the handoff completes.
            if let Err(e) = announce(coordinator, StatusType::ServerShutdown, &me, None).await {
                error!(coordinator = %coordinator, error = %e, "Graceful leave failed");
            }
        }

        state.stop()?;
        accept.abort();
        blocking(move || store.close()).await?;
        info!(node = %me, "Server stopped");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, me: NodeId) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "Accepted connection");
                let dispatcher = Arc::clone(&dispatcher);
                let me = me.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, dispatcher, &me).await {
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

async fn serve_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>, me: &NodeId) -> Result<()> {
    let mut connection = TcpTransport::new(stream, None);
    connection
        .write_line(&format!("{} {} ready", WELCOME_PREFIX, me))
        .await?;

    while let Some(line) = connection.read_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatcher.dispatch_line(&line).await;
        connection.send(&reply).await?;
    }
    debug!(peer = %connection.peer(), "Peer disconnected");
    Ok(())
}

/// Send `server_start`/`server_shutdown` to the coordinator and await `ecs_ack`
async fn announce(
    coordinator: &NodeId,
    status: StatusType,
    me: &NodeId,
    timeout: Option<Duration>,
) -> Result<()> {
    let connector = TcpConnector::without_welcome(timeout);
    let mut connection = connector.connect(coordinator).await?;
    let request = KvMessage::with_value(status, me.address(), me.port().to_string());
    let reply = connection.request(&request).await?;
    // Best effort: the exchange already succeeded or failed.
    let _ = connection.disconnect().await;

    if reply.status() == StatusType::EcsAck {
        Ok(())
    } else {
        Err(Error::UnexpectedPeerResponse {
            expected: StatusType::EcsAck.to_string(),
            received: reply.to_string(),
        })
    }
}
