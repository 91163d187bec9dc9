//! Cross-node transport tests over real TCP sockets.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use hivecore_cluster::{
    ClusterError, ClusterNode, HashRing, LoadBalancePolicy, MockRemoteActor, RemoteActor,
    RemoteActorClient, RpcServer,
};
use hivecore_rt::cell::ActorCell;
use hivecore_rt::handler::{HandlerFuture, HandlerSet};
use hivecore_rt::message::MessageContext;
use hivecore_rt::registry::ActorSystemRegistry;
use hivecore_rt::state::NullStateStore;
use hivecore_rt::system::{ActorSystem, SystemOptions};
use hivecore_shared::ids::NodeId;

fn count<'a>(
    cell: &'a mut ActorCell<i64>,
    payload: Value,
    _ctx: MessageContext,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if cell.state().is_none() {
            cell.set_state(0);
        }
        let delta = payload["delta"].as_i64().unwrap_or(1);
        let state = cell.state_mut().unwrap();
        *state += delta;
        Ok(json!(*state))
    })
}

fn player_registry() -> Arc<ActorSystemRegistry> {
    let registry = Arc::new(ActorSystemRegistry::new());
    registry.register(Arc::new(ActorSystem::new(
        "player",
        SystemOptions::default(),
        HandlerSet::new().on("count", count),
        Arc::new(NullStateStore),
    )));
    registry
}

/// One node: a registry, its RPC server, and the ring entry to reach it.
async fn start_node(registry: Arc<ActorSystemRegistry>) -> (RpcServer, NodeId) {
    let server = RpcServer::bind("127.0.0.1:0", registry).await.unwrap();
    let addr = server.local_addr();
    let node_id = NodeId::new(&addr.ip().to_string(), addr.port());
    (server, node_id)
}

fn ring_of(nodes: &[NodeId]) -> Arc<HashRing> {
    let ring = HashRing::new(64);
    ring.rebuild(
        nodes
            .iter()
            .map(|n| ClusterNode::new(n.clone(), vec!["player".to_string()]))
            .collect(),
    );
    Arc::new(ring)
}

#[tokio::test]
async fn remote_ask_and_tell_round_trip() {
    let remote_registry = player_registry();
    let (_server, remote_node) = start_node(Arc::clone(&remote_registry)).await;

    // The caller is a different node entirely; everything goes over TCP.
    let caller_registry = Arc::new(ActorSystemRegistry::new());
    let caller_node = NodeId::new("127.0.0.1", 1);
    let ring = ring_of(&[remote_node.clone()]);
    let client = RemoteActorClient::new(caller_node, caller_registry, ring);

    let value = client
        .ask("player", "p-1", "count", json!({"delta": 5}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(value, json!(5));

    assert!(client
        .tell("player", "p-1", "count", json!({"delta": 3}))
        .await
        .unwrap());

    // The tell landed on the same remote actor.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let value = client
            .ask("player", "p-1", "count", json!({"delta": 0}), Duration::from_secs(2))
            .await
            .unwrap();
        if value == json!(8) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn has_actor_reflects_remote_liveness() {
    let remote_registry = player_registry();
    let (_server, remote_node) = start_node(Arc::clone(&remote_registry)).await;
    let client = RemoteActorClient::new(
        NodeId::new("127.0.0.1", 1),
        Arc::new(ActorSystemRegistry::new()),
        ring_of(&[remote_node]),
    );

    assert!(!client.has_actor("player", "p-404").await.unwrap());
    client
        .ask("player", "p-404", "count", json!({}), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(client.has_actor("player", "p-404").await.unwrap());
}

#[tokio::test]
async fn self_owned_calls_skip_the_wire() {
    let registry = player_registry();
    let self_node = NodeId::new("127.0.0.1", 7777);
    // No server is listening on 7777: the local shortcut must carry it.
    let client = RemoteActorClient::new(
        self_node.clone(),
        Arc::clone(&registry),
        ring_of(&[self_node]),
    );

    let value = client
        .ask("player", "p-local", "count", json!({"delta": 2}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(value, json!(2));
}

#[tokio::test]
async fn batch_tell_spans_owning_nodes() {
    let registry_a = player_registry();
    let registry_b = player_registry();
    let (_server_a, node_a) = start_node(Arc::clone(&registry_a)).await;
    let (_server_b, node_b) = start_node(Arc::clone(&registry_b)).await;

    let client = RemoteActorClient::new(
        NodeId::new("127.0.0.1", 1),
        Arc::new(ActorSystemRegistry::new()),
        ring_of(&[node_a, node_b]),
    );

    let ids: Vec<String> = (0..20).map(|i| format!("p-{i}")).collect();
    let accepted = client
        .batch_tell("player", &ids, "count", json!({"delta": 1}))
        .await
        .unwrap();
    assert_eq!(accepted, 20);

    // Every id is live on exactly one of the two nodes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let live: usize = ids
            .iter()
            .map(|id| {
                let a = registry_a.get("player").unwrap().has_actor(id);
                let b = registry_b.get("player").unwrap().has_actor(id);
                assert!(!(a && b), "actor {id} live on both nodes");
                usize::from(a || b)
            })
            .sum();
        if live == 20 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unknown_system_surfaces_service_unavailable() {
    let registry = player_registry();
    let (_server, node) = start_node(Arc::clone(&registry)).await;
    let ring = HashRing::new(64);
    ring.rebuild(vec![ClusterNode::new(
        node.clone(),
        vec!["battle".to_string()],
    )]);
    let client = RemoteActorClient::new(
        NodeId::new("127.0.0.1", 1),
        Arc::new(ActorSystemRegistry::new()),
        Arc::new(ring),
    );

    // The node claims to host "battle" but its registry does not.
    let result = client
        .ask("battle", "b-1", "count", json!({}), Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(ClusterError::Remote { .. })));

    // And a system no node hosts never leaves the client.
    let result = client
        .tell("player", "p-1", "count", json!({}))
        .await;
    assert!(matches!(result, Err(ClusterError::NoNodes { .. })));
}

#[tokio::test]
async fn round_robin_rotates_over_hosting_nodes() {
    let registry_a = player_registry();
    let registry_b = player_registry();
    let (_server_a, node_a) = start_node(Arc::clone(&registry_a)).await;
    let (_server_b, node_b) = start_node(Arc::clone(&registry_b)).await;

    let client = RemoteActorClient::new(
        NodeId::new("127.0.0.1", 1),
        Arc::new(ActorSystemRegistry::new()),
        ring_of(&[node_a, node_b]),
    )
    .with_policy(LoadBalancePolicy::RoundRobin);

    // Same actor id every time: with round-robin the target alternates, so
    // both registries end up hosting a copy.
    for _ in 0..4 {
        client
            .ask("player", "rr-1", "count", json!({"delta": 1}), Duration::from_secs(2))
            .await
            .unwrap();
    }
    assert!(registry_a.get("player").unwrap().has_actor("rr-1"));
    assert!(registry_b.get("player").unwrap().has_actor("rr-1"));
}

#[tokio::test]
async fn mock_provider_reports_service_unavailable() {
    let mock = MockRemoteActor::new("remoteActor:player");
    let result = mock.tell("player", "p-1", "count", json!({})).await;
    assert!(matches!(
        result,
        Err(ClusterError::ServiceUnavailable { .. })
    ));
    let result = mock
        .ask("player", "p-1", "count", json!({}), Duration::from_secs(1))
        .await;
    assert!(matches!(
        result,
        Err(ClusterError::ServiceUnavailable { .. })
    ));
}
