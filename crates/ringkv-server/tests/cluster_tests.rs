// End-to-end tests over TCP with a coordinator and real servers

use ringkv::{
    Coordinator, CoordinatorConfig, KvClient, KvServer, KvStore, NodeId, Result, ServerConfig,
    StatusType, StorageConfig, SyncMode, TcpTransport, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct RunningServer {
    id: NodeId,
    store: KvStore,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
    _temp_dir: TempDir,
}

impl RunningServer {
    async fn start(coordinator: Option<&NodeId>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = ServerConfig::new(NodeId::new("127.0.0.1", 0), temp_dir.path())
            .with_storage(StorageConfig {
                minimum_degree: 3,
                sync_mode: SyncMode::None,
            });
        if let Some(coordinator) = coordinator {
            config = config.with_coordinator(coordinator.clone());
        }

        let server = KvServer::bind(config).await.expect("Failed to bind server");
        let id = server.node_id().clone();
        let store = server.store().clone();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));

        Self {
            id,
            store,
            stop,
            task,
            _temp_dir: temp_dir,
        }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap().unwrap();
    }
}

async fn start_coordinator() -> (Arc<Coordinator>, NodeId) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let id = NodeId::new("127.0.0.1", listener.local_addr().unwrap().port());
    let config = CoordinatorConfig {
        listen: id.clone(),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(5),
    };
    let coordinator = Arc::new(Coordinator::new(config));
    tokio::spawn(Arc::clone(&coordinator).serve(listener));
    (coordinator, id)
}

async fn wait_for_members(coordinator: &Coordinator, count: usize) {
    let joined = tokio::time::timeout(Duration::from_secs(10), async {
        while coordinator.ring().await.len() != count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(joined.is_ok(), "ring never reached {} members", count);
}

fn keys() -> Vec<String> {
    (0..50).map(|i| format!("key-{}", i)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keys_follow_membership_changes() {
    let (coordinator, ecs) = start_coordinator().await;

    let first = RunningServer::start(Some(&ecs)).await;
    wait_for_members(&coordinator, 1).await;

    let mut client = KvClient::new(first.id.clone());
    for key in keys() {
        let status = client.put(&key, &format!("value of {}", key)).await.unwrap();
        assert_eq!(status, StatusType::PutSuccess);
    }

    let second = RunningServer::start(Some(&ecs)).await;
    wait_for_members(&coordinator, 2).await;

    let ring = coordinator.ring().await;
    assert_eq!(first.store.len().unwrap() + second.store.len().unwrap(), 50);
    for key in keys() {
        let owner = ring.responsible_node(&key).unwrap();
        let store = if *owner == first.id {
            &first.store
        } else {
            &second.store
        };
        assert!(store.get(&key).unwrap().is_some(), "{} is not on {}", key, owner);
    }
    for key in keys() {
        assert_eq!(
            client.get(&key).await.unwrap(),
            Some(format!("value of {}", key))
        );
    }

    second.shutdown().await;
    wait_for_members(&coordinator, 1).await;
    assert_eq!(first.store.len().unwrap(), 50);
    for key in keys() {
        assert_eq!(
            client.get(&key).await.unwrap(),
            Some(format!("value of {}", key))
        );
    }

    first.shutdown().await;
    assert!(coordinator.ring().await.is_empty());
}

#[tokio::test]
async fn test_standalone_server_speaks_line_protocol() {
    let server = RunningServer::start(None).await;

    let mut raw = TcpTransport::connect(&server.id, Some(Duration::from_secs(5)), true)
        .await
        .unwrap();
    raw.write_line("put greeting hello there").await.unwrap();
    assert_eq!(raw.read_line().await.unwrap().unwrap(), "put_success greeting");
    raw.write_line("get greeting").await.unwrap();
    assert_eq!(
        raw.read_line().await.unwrap().unwrap(),
        "get_success greeting hello there"
    );
    raw.write_line("not a verb").await.unwrap();
    assert_eq!(raw.read_line().await.unwrap().unwrap(), "error");
    raw.disconnect().await.unwrap();

    let mut client = KvClient::new(server.id.clone());
    assert!(client.delete("greeting").await.unwrap());
    assert_eq!(client.get("greeting").await.unwrap(), None);

    server.shutdown().await;
}
