// Client routing against in-process servers

mod common;

use common::{node, LoopbackConnector, TestNode};
use ringkv::{DebugHash, Error, HandoffMode, KvClient, RetryPolicy, SharedHasher, StatusType};
use std::sync::Arc;

const METADATA: &str = "28,5b,127.0.0.1:5000;5a,29,127.0.0.1:5001;";

fn hasher() -> SharedHasher {
    Arc::new(
        DebugHash::new(99)
            .with_node(&node(5000), 40)
            .with_node(&node(5001), 90)
            .with("k10", 10)
            .with("k60", 60),
    )
}

async fn two_members(connector: &LoopbackConnector) -> (TestNode, TestNode) {
    let a = TestNode::new(node(5000), hasher(), connector, HandoffMode::Inline);
    let b = TestNode::new(node(5001), hasher(), connector, HandoffMode::Inline);
    for member in [&a, &b] {
        let reply = member
            .request(&format!("ecs_set_keyrange {}", METADATA))
            .await;
        assert_eq!(reply, "server_ack");
    }
    (a, b)
}

fn client(connector: &LoopbackConnector, policy: RetryPolicy) -> KvClient {
    KvClient::with_parts(node(5000), hasher(), connector.shared(), policy)
}

#[tokio::test]
async fn test_redirect_reaches_the_owner() {
    let connector = LoopbackConnector::new();
    let (a, b) = two_members(&connector).await;
    let mut client = client(&connector, RetryPolicy::immediate(3));

    assert_eq!(client.put("k60", "sixty").await.unwrap(), StatusType::PutSuccess);
    assert_eq!(client.ring().len(), 2);
    assert_eq!(b.store.get("k60").unwrap(), Some("sixty".to_string()));
    assert_eq!(a.store.get("k60").unwrap(), None);

    assert_eq!(client.put("k10", "ten").await.unwrap(), StatusType::PutSuccess);
    assert_eq!(client.put("k10", "TEN").await.unwrap(), StatusType::PutUpdate);
    assert_eq!(a.store.get("k10").unwrap(), Some("TEN".to_string()));

    assert_eq!(client.get("k60").await.unwrap(), Some("sixty".to_string()));
    assert_eq!(client.get("missing").await.unwrap(), None);
    assert!(client.delete("k60").await.unwrap());
    assert!(!client.delete("k60").await.unwrap());
}

#[tokio::test]
async fn test_refresh_ring_from_bootstrap() {
    let connector = LoopbackConnector::new();
    two_members(&connector).await;
    let mut client = client(&connector, RetryPolicy::immediate(1));

    client.refresh_ring().await.unwrap();
    assert_eq!(client.ring().serialize(), METADATA);
}

#[tokio::test]
async fn test_write_lock_exhausts_retries() {
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher(), &connector, HandoffMode::Inline);
    a.request("put k10 ten").await;
    a.request("ecs_write_lock").await;
    let mut client = client(&connector, RetryPolicy::immediate(3));

    let result = client.put("k10", "other").await;
    assert!(matches!(result, Err(Error::Communication(_))));
    assert_eq!(client.get("k10").await.unwrap(), Some("ten".to_string()));

    a.request("ecs_write_unlock").await;
    assert_eq!(client.put("k10", "other").await.unwrap(), StatusType::PutUpdate);
}

#[tokio::test]
async fn test_stopped_cluster_exhausts_retries() {
    let connector = LoopbackConnector::new();
    let _a = TestNode::new(node(5000), hasher(), &connector, HandoffMode::Inline);
    let mut client = client(&connector, RetryPolicy::immediate(2));

    assert!(matches!(
        client.get("k10").await,
        Err(Error::Communication(_))
    ));
}

#[tokio::test]
async fn test_unreachable_bootstrap() {
    let connector = LoopbackConnector::new();
    let mut client = client(&connector, RetryPolicy::immediate(2));

    assert!(matches!(
        client.put("k10", "ten").await,
        Err(Error::Communication(_))
    ));
    assert!(client.refresh_ring().await.is_err());
}
