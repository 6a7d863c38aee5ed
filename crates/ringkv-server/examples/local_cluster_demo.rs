use ringkv::logging::LogConfig;
use ringkv::{
    Coordinator, CoordinatorConfig, KvClient, KvServer, NodeId, ServerConfig, StorageConfig,
    SyncMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (info level with compact output to stdout)
    let _guard = LogConfig::info().init()?;

    println!("=== RingKV Local Cluster Demo ===\n");

    let data = tempfile::tempdir()?;

    // Coordinator on a free port
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let ecs = NodeId::new("127.0.0.1", listener.local_addr()?.port());
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
        listen: ecs.clone(),
        ..CoordinatorConfig::default()
    }));
    tokio::spawn(Arc::clone(&coordinator).serve(listener));

    println!("1. Starting three servers...");
    let mut servers = Vec::new();
    for i in 0..3 {
        let dir = data.path().join(format!("node-{}", i));
        let config = ServerConfig::new(NodeId::new("127.0.0.1", 0), dir)
            .with_coordinator(ecs.clone())
            .with_storage(StorageConfig {
                minimum_degree: 8,
                sync_mode: SyncMode::None,
            });
        let server = KvServer::bind(config).await?;
        let id = server.node_id().clone();
        let store = server.store().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));
        servers.push((id, store, stop, task));

        while coordinator.ring().await.len() != i + 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    println!("\n2. Writing through the client...");
    let mut client = KvClient::new(servers[0].0.clone());
    for i in 0..100 {
        client
            .put(&format!("user:{}", i), &format!("User number {}", i))
            .await?;
    }
    if let Some(value) = client.get("user:42").await? {
        println!("Found: {}", value);
    }

    // Replicas are filled in the background.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("\n3. Key copies (owner plus two successors):");
    println!("   read ranges: {}", client.read_ranges().await?);
    for (id, store, _, _) in &servers {
        println!("   {} holds {} keys", id, store.len()?);
    }

    println!("\n4. Shutting down one server gracefully...");
    let (id, _, stop, task) = servers.remove(1);
    let _ = stop.send(());
    task.await??;
    println!("   {} left; its keys moved to its successor", id);
    for (id, store, _, _) in &servers {
        println!("   {} holds {} keys", id, store.len()?);
    }

    for (_, _, stop, task) in servers {
        let _ = stop.send(());
        task.await??;
    }

    println!("\n=== Demo Complete ===");
    Ok(())
}
