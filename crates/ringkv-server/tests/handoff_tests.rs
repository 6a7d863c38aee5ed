// Integration tests for range handoff between servers

mod common;

use common::{node, LoopbackConnector, TestNode};
use ringkv::{
    DebugHash, Error, HandoffCoordinator, HandoffMode, HashRing, RingRange, SharedHasher,
};
use std::sync::Arc;

fn pinned(entries: &[(&str, u128)], nodes: &[(u16, u128)]) -> SharedHasher {
    let mut hasher = DebugHash::new(99);
    for (key, position) in entries {
        hasher = hasher.with(*key, *position);
    }
    for (port, position) in nodes {
        hasher = hasher.with_node(&node(*port), *position);
    }
    Arc::new(hasher)
}

fn keys_of(node: &TestNode) -> Vec<String> {
    node.store
        .scan_hash_range(&RingRange::full(99))
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

#[tokio::test]
async fn test_join_moves_exactly_the_ceded_arc() {
    let hasher = pinned(
        &[("k20", 20), ("k50", 50), ("k55", 55), ("k60", 60), ("k70", 70), ("k80", 80)],
        &[(5000, 50), (5001, 70)],
    );
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher.clone(), &connector, HandoffMode::Inline);
    let b = TestNode::new(node(5001), hasher.clone(), &connector, HandoffMode::Inline);
    for key in ["k20", "k50", "k55", "k60", "k70", "k80"] {
        a.store.put(key, Some(&format!("value-{}", key))).unwrap();
    }

    let mut before = HashRing::with_hasher(hasher.clone());
    before.add_node(a.id.clone()).unwrap();
    let mut after = before.clone();
    after.add_node(b.id.clone()).unwrap();
    let ceded = before.ceded_ranges(&after, &a.id);
    assert_eq!(ceded, vec![RingRange::new(51, 70, 99)]);

    let handoff = HandoffCoordinator::new(a.store.clone(), connector.shared());
    let report = handoff.migrate(ceded[0], &b.id).await.unwrap();

    assert_eq!(report.transferred, vec!["k55", "k60", "k70"]);
    assert!(report.is_complete());
    assert_eq!(keys_of(&a), vec!["k20", "k50", "k80"]);
    assert_eq!(keys_of(&b), vec!["k55", "k60", "k70"]);
    for key in ["k55", "k60", "k70"] {
        assert_eq!(b.store.get(key).unwrap(), Some(format!("value-{}", key)));
    }
}

#[tokio::test]
async fn test_failed_key_stays_on_source() {
    let keys = [("k1", 51), ("k2", 52), ("k3", 53), ("k4", 54), ("k5", 55)];
    let hasher = pinned(&keys, &[(5000, 50), (5001, 70)]);
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher.clone(), &connector, HandoffMode::Inline);
    let b = TestNode::new(node(5001), hasher.clone(), &connector, HandoffMode::Inline);
    for (key, _) in keys {
        a.store.put(key, Some(key)).unwrap();
    }

    connector.fail_put_server_at(4);
    let handoff = HandoffCoordinator::new(a.store.clone(), connector.shared());
    let report = handoff
        .migrate(RingRange::new(51, 70, 99), &b.id)
        .await
        .unwrap();

    assert_eq!(report.transferred, vec!["k1", "k2", "k3", "k5"]);
    assert_eq!(report.retained, vec!["k4"]);
    assert!(!report.is_complete());
    assert_eq!(keys_of(&a), vec!["k4"]);
    assert_eq!(a.store.get("k4").unwrap(), Some("k4".to_string()));
    assert_eq!(keys_of(&b), vec!["k1", "k2", "k3", "k5"]);

    // The next handoff of the same range picks up the leftover.
    let retry = handoff
        .migrate(RingRange::new(51, 70, 99), &b.id)
        .await
        .unwrap();
    assert_eq!(retry.transferred, vec!["k4"]);
    assert!(a.store.is_empty().unwrap());
}

#[tokio::test]
async fn test_unreachable_destination_deletes_nothing() {
    let hasher = pinned(&[("k55", 55)], &[(5000, 50)]);
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher, &connector, HandoffMode::Inline);
    a.store.put("k55", Some("v")).unwrap();

    let handoff = HandoffCoordinator::new(a.store.clone(), connector.shared());
    let result = handoff.migrate(RingRange::new(51, 70, 99), &node(5009)).await;

    assert!(matches!(result, Err(Error::HandoffFailure(_))));
    assert_eq!(a.store.get("k55").unwrap(), Some("v".to_string()));
}

#[tokio::test]
async fn test_wrapping_range_handoff() {
    let hasher = pinned(&[("k95", 95), ("k5", 5), ("k50", 50)], &[(5000, 10), (5001, 90)]);
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher.clone(), &connector, HandoffMode::Inline);
    let b = TestNode::new(node(5001), hasher, &connector, HandoffMode::Inline);
    for key in ["k95", "k5", "k50"] {
        a.store.put(key, Some(key)).unwrap();
    }

    let handoff = HandoffCoordinator::new(a.store.clone(), connector.shared());
    let report = handoff
        .migrate(RingRange::new(91, 10, 99), &b.id)
        .await
        .unwrap();

    assert_eq!(report.transferred, vec!["k95", "k5"]);
    assert_eq!(keys_of(&a), vec!["k50"]);
}

#[tokio::test]
async fn test_background_handoff_protocol() {
    let hasher = pinned(&[("k20", 20), ("k60", 60)], &[(5000, 50), (5001, 70)]);
    let connector = LoopbackConnector::new();
    let a = TestNode::standalone(node(5000), hasher.clone(), &connector, HandoffMode::Background);
    let b = TestNode::new(node(5001), hasher, &connector, HandoffMode::Background);
    a.store.put("k20", Some("twenty")).unwrap();
    a.store.put("k60", Some("sixty")).unwrap();

    assert_eq!(a.request("ecs_write_lock").await, "server_write_lock");
    assert_eq!(a.request("put k20 changed").await, "server_write_lock");
    assert_eq!(a.request("get k20").await, "get_success k20 twenty");

    assert_eq!(
        a.request("ecs_handoff 127.0.0.1:5001 0x33 0x46").await,
        "server_ack"
    );
    assert_eq!(
        a.request("ecs_waiting_for_handoff").await,
        "server_handoff_success"
    );
    assert_eq!(a.request("ecs_write_unlock").await, "server_write_unlock");

    assert_eq!(keys_of(&a), vec!["k20"]);
    assert_eq!(b.store.get("k60").unwrap(), Some("sixty".to_string()));
    assert_eq!(a.request("put k20 changed").await, "put_update k20");
}
