// Integration tests for request dispatch on a single server

mod common;

use common::{node, LoopbackConnector, TestNode};
use ringkv::{DebugHash, HandoffMode, NodeState, SharedHasher};
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

/// Node at 40 that has received the two-member ring
async fn member(connector: &LoopbackConnector) -> TestNode {
    let node = TestNode::new(node(5000), hasher(), connector, HandoffMode::Inline);
    assert_eq!(
        node.request(&format!("ecs_set_keyrange {}", METADATA)).await,
        "server_ack"
    );
    node
}

#[tokio::test]
async fn test_stopped_node_only_answers_control_traffic() {
    let connector = LoopbackConnector::new();
    let a = TestNode::new(node(5000), hasher(), &connector, HandoffMode::Inline);

    assert_eq!(a.request("get k10").await, "server_stopped");
    assert_eq!(a.request("put k10 v").await, "server_stopped");
    assert_eq!(a.request("keyrange").await, "server_stopped");

    assert_eq!(a.request("ecs_heart_beat").await, "server_heart_beat");
    assert_eq!(a.request("put_server k10 v").await, "put_success k10");
    assert_eq!(a.store.get("k10").unwrap(), Some("v".to_string()));
}

#[tokio::test]
async fn test_set_keyrange_starts_a_stopped_node() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;

    assert_eq!(a.state.state().unwrap(), NodeState::Active);
    assert_eq!(
        a.request("keyrange").await,
        format!("keyrange_success {}", METADATA)
    );
}

#[tokio::test]
async fn test_client_operations() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;

    assert_eq!(a.request("get k10").await, "get_error k10");
    assert_eq!(a.request("put k10 ten").await, "put_success k10");
    assert_eq!(a.request("put k10 hello big world").await, "put_update k10");
    assert_eq!(a.request("get k10").await, "get_success k10 hello big world");
    assert_eq!(a.request("delete k10").await, "delete_success k10");
    assert_eq!(a.request("delete k10").await, "delete_error k10");

    // A put without a value deletes.
    assert_eq!(a.request("put k10 again").await, "put_success k10");
    assert_eq!(a.request("put k10").await, "delete_success k10");
    assert_eq!(a.request("get k10").await, "get_error k10");
}

#[tokio::test]
async fn test_foreign_key_redirects_with_metadata() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;
    let redirect = format!("server_not_responsible {}", METADATA);

    assert_eq!(a.request("get k60").await, redirect);
    assert_eq!(a.request("put k60 v").await, redirect);
    assert_eq!(a.request("delete k60").await, redirect);
    assert!(a.store.is_empty().unwrap());
}

#[tokio::test]
async fn test_write_lock_blocks_only_writes() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;
    a.request("put k10 ten").await;

    assert_eq!(a.request("ecs_write_lock").await, "server_write_lock");
    assert_eq!(a.request("put k10 other").await, "server_write_lock");
    assert_eq!(a.request("delete k10").await, "server_write_lock");
    assert_eq!(a.request("get k10").await, "get_success k10 ten");

    // Servers pushing a handoff are not held back by the lock.
    assert_eq!(a.request("put_server k10 moved").await, "put_update k10");

    assert_eq!(a.request("ecs_write_unlock").await, "server_write_unlock");
    assert_eq!(a.request("put k10 other").await, "put_update k10");
}

#[tokio::test]
async fn test_set_keyrange_lifts_write_lock() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;

    assert_eq!(a.request("ecs_write_lock").await, "server_write_lock");
    assert_eq!(
        a.request(&format!("ecs_set_keyrange {}", METADATA)).await,
        "server_ack"
    );
    assert_eq!(a.state.state().unwrap(), NodeState::Active);
    // Unlocking an active node is a no-op.
    assert_eq!(a.request("ecs_write_unlock").await, "server_write_unlock");
}

#[tokio::test]
async fn test_put_server_skips_responsibility() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;

    assert_eq!(a.request("put_server k60 incoming").await, "put_success k60");
    assert_eq!(a.store.get("k60").unwrap(), Some("incoming".to_string()));
}

#[tokio::test]
async fn test_invalid_requests_get_error() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;

    assert_eq!(a.request("bogus k10").await, "error");
    assert_eq!(a.request("").await, "error");
    assert_eq!(a.request("get").await, "error");
    assert_eq!(a.request("get_success k10 v").await, "error");
    assert_eq!(a.request("ecs_set_keyrange zz,yy,nowhere").await, "error");
    assert_eq!(a.request("ecs_handoff 127.0.0.1:5001 0x33").await, "error");
    assert_eq!(a.request("ecs_handoff not-a-node 0x33 0x46").await, "error");

    assert_eq!(a.state.state().unwrap(), NodeState::Active);
}

#[tokio::test]
async fn test_handoff_bounds_outside_hash_space_are_rejected() {
    let connector = LoopbackConnector::new();
    let a = member(&connector).await;
    let _b = TestNode::new(node(5001), hasher(), &connector, HandoffMode::Inline);
    a.request("put k10 ten").await;

    assert_eq!(a.request("ecs_handoff 127.0.0.1:5001 0x1ff 0x46").await, "error");
    assert_eq!(a.request("ecs_handoff 127.0.0.1:5001 0x0 0x64").await, "error");
    assert_eq!(a.store.get("k10").unwrap(), Some("ten".to_string()));
}

#[tokio::test]
async fn test_keyrange_read_without_replication() {
    let connector = LoopbackConnector::new();
    let stopped = TestNode::new(node(5001), hasher(), &connector, HandoffMode::Inline);
    assert_eq!(stopped.request("keyrange_read").await, "server_stopped");

    // Two members cannot hold two extra copies: read arcs equal write arcs.
    let a = member(&connector).await;
    assert_eq!(
        a.request("keyrange_read").await,
        format!("keyrange_read_success {}", METADATA)
    );
}

#[tokio::test]
async fn test_write_lock_requires_active_node() {
    let connector = LoopbackConnector::new();
    let a = TestNode::new(node(5000), hasher(), &connector, HandoffMode::Inline);

    assert_eq!(a.request("ecs_write_lock").await, "error");
    assert_eq!(a.state.state().unwrap(), NodeState::Stopped);
}

#[tokio::test]
async fn test_inline_handoff_finishes_before_ack() {
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher(), &connector, HandoffMode::Inline);
    let b = TestNode::new(node(5001), hasher(), &connector, HandoffMode::Inline);
    a.request("put k10 ten").await;
    a.request("put k60 sixty").await;

    assert_eq!(a.request("ecs_write_lock").await, "server_write_lock");
    assert_eq!(
        a.request("ecs_handoff 127.0.0.1:5001 0x29 0x5a").await,
        "server_ack"
    );
    assert_eq!(b.store.get("k60").unwrap(), Some("sixty".to_string()));
    assert_eq!(a.store.get("k60").unwrap(), None);
    assert_eq!(a.store.get("k10").unwrap(), Some("ten".to_string()));

    assert_eq!(
        a.request("ecs_waiting_for_handoff").await,
        "server_handoff_success"
    );
}

#[tokio::test]
async fn test_handoff_to_unknown_peer_reports_error() {
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher(), &connector, HandoffMode::Background);
    a.request("put k60 sixty").await;

    assert_eq!(
        a.request("ecs_handoff 127.0.0.1:5009 0x29 0x5a").await,
        "server_ack"
    );
    assert_eq!(a.request("ecs_waiting_for_handoff").await, "error");
    assert_eq!(a.store.get("k60").unwrap(), Some("sixty".to_string()));
}
