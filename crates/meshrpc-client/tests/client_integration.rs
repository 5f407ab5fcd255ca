//! End-to-end tests for the network client against real TCP nodes.
//!
//! Each fake node is a `TcpListener` speaking the frame codec: echo nodes
//! answer every request with its own body, refusing nodes accept connections
//! and immediately drop them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use meshrpc_client::{ClientConfig, NetworkClient, PoolConfig, SendOptions};
use meshrpc_common::{Endpoint, Frame, FrameCodec, Node, RpcError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

struct FakeNode {
    endpoint: Endpoint,
    accepted: Arc<AtomicUsize>,
    received: Arc<AtomicUsize>,
}

/// A node that answers every request frame with its own body.
async fn spawn_echo_node(id: u32) -> FakeNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(AtomicUsize::new(0));

    let accepted_counter = Arc::clone(&accepted);
    let received_counter = Arc::clone(&received);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted_counter.fetch_add(1, Ordering::SeqCst);
            let received_counter = Arc::clone(&received_counter);
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, FrameCodec);
                while let Some(Ok(frame)) = framed.next().await {
                    received_counter.fetch_add(1, Ordering::SeqCst);
                    let reply = Frame::response(frame.id, frame.body);
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    FakeNode {
        endpoint: Endpoint::new(Node::new(id, "127.0.0.1", port)),
        accepted,
        received,
    }
}

/// A node that accepts connections and immediately drops them.
async fn spawn_refusing_node(id: u32) -> FakeNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let accepted_counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted_counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    FakeNode {
        endpoint: Endpoint::new(Node::new(id, "127.0.0.1", port)),
        accepted,
        received: Arc::new(AtomicUsize::new(0)),
    }
}

fn single_connection_config() -> ClientConfig {
    ClientConfig {
        pool: PoolConfig {
            max_connections_per_node: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn watched_send(
    client: &NetworkClient,
    payload: Value,
) -> oneshot::Receiver<Result<Value, RpcError>> {
    let (tx, rx) = oneshot::channel();
    client.send_request("echo", Some(payload), SendOptions::default(), move |result| {
        let _ = tx.send(result);
    });
    rx
}

#[tokio::test]
async fn test_immediate_dispatch_round_trip() {
    let node = spawn_echo_node(1).await;
    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![node.endpoint.clone()]);

    let payload = json!({"query": "state-of-the-cluster"});
    let response: Value = client
        .request("echo", Some(payload.clone()), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response, payload);

    let snapshot = client.stats_snapshot();
    let stats = &snapshot.nodes[&1];
    assert_eq!(stats.latency.sample_count, 1);
    assert_eq!(stats.pending.count, 0);
    let gauges = stats.gauges.as_ref().unwrap();
    assert_eq!(gauges.requests_sent, 1);
    assert_eq!(gauges.open_channels, 1);
    assert_eq!(gauges.max_channels, 1);
}

#[tokio::test]
async fn test_burst_queues_behind_open_and_correlates() {
    let node = spawn_echo_node(1).await;
    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![node.endpoint.clone()]);

    // Submitted back-to-back before the connect can complete: both wait in
    // the queue and drain on the same socket once it opens
    let rx1 = watched_send(&client, json!("first"));
    let rx2 = watched_send(&client, json!("second"));

    let r1 = tokio::time::timeout(Duration::from_secs(5), rx1)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let r2 = tokio::time::timeout(Duration::from_secs(5), rx2)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Each caller got its own response back
    assert_eq!(r1, json!("first"));
    assert_eq!(r2, json!("second"));
    assert_eq!(node.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(node.received.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_lands_on_a_different_node() {
    let bad = spawn_refusing_node(1).await;
    let good = spawn_echo_node(2).await;

    let client = NetworkClient::round_robin(single_connection_config());
    // Round-robin starts at the refusing node
    client.update_endpoints(vec![bad.endpoint.clone(), good.endpoint.clone()]);

    let options = SendOptions {
        max_retry: Some(1),
        ..Default::default()
    };
    let response: Value = client
        .request("echo", Some(json!("survives")), options)
        .await
        .unwrap();

    assert_eq!(response, json!("survives"));
    assert!(bad.accepted.load(Ordering::SeqCst) >= 1);
    assert_eq!(good.received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_not_taken_when_selection_repeats_the_node() {
    let bad = spawn_refusing_node(1).await;
    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![bad.endpoint.clone()]);

    let options = SendOptions {
        max_retry: Some(3),
        ..Default::default()
    };
    let err = client
        .request::<Value, Value>("echo", Some(json!("doomed")), options)
        .await
        .unwrap_err();

    // The original transport failure propagates, not NoNodesAvailable, and
    // no second attempt is made against the same node
    assert!(
        matches!(err, RpcError::WriteError { .. }),
        "expected the original write error, got {err:?}"
    );
    assert_eq!(bad.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fire_and_forget_reaches_the_node() {
    let node = spawn_echo_node(1).await;
    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![node.endpoint.clone()]);

    client
        .send_message("echo", Some(json!("no answer expected")), SendOptions::default())
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while node.received.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the node should receive the message");

    // Nothing pending: no response was ever expected
    let snapshot = client.stats_snapshot();
    assert!(snapshot
        .nodes
        .get(&1)
        .map(|n| n.pending.count == 0)
        .unwrap_or(true));
}

#[tokio::test]
async fn test_statistics_accumulate_over_requests() {
    let node = spawn_echo_node(1).await;
    let mut config = single_connection_config();
    // Uncached statistics so the snapshot sees every sample
    config.stats.refresh_interval_ms = 0;
    let client = NetworkClient::round_robin(config);
    client.update_endpoints(vec![node.endpoint.clone()]);

    for i in 0..5 {
        let _: Value = client
            .request("echo", Some(json!(i)), SendOptions::default())
            .await
            .unwrap();
    }

    let snapshot = client.stats_snapshot();
    let stats = &snapshot.nodes[&1];
    assert_eq!(stats.latency.sample_count, 5);
    assert!(stats.latency.rps >= 1);
    assert!(stats.latency.median <= stats.latency.p99);
    assert_eq!(stats.pending.count, 0);
    assert!(stats.health_score.is_finite());
    assert_eq!(stats.gauges.as_ref().unwrap().requests_sent, 5);
    assert!(client.node_health_score(1).is_some());
}

#[tokio::test]
async fn test_membership_change_redirects_traffic() {
    let first = spawn_echo_node(1).await;
    let second = spawn_echo_node(2).await;

    let mut config = single_connection_config();
    config.membership_grace_ms = 20;
    let client = NetworkClient::round_robin(config);
    client.update_endpoints(vec![first.endpoint.clone(), second.endpoint.clone()]);

    let _: Value = client
        .request("echo", Some(json!("warmup")), SendOptions::default())
        .await
        .unwrap();

    // Node 1 leaves; all traffic goes to node 2
    client.update_endpoints(vec![second.endpoint.clone()]);
    let before = second.received.load(Ordering::SeqCst);
    for i in 0..4 {
        let _: Value = client
            .request("echo", Some(json!(i)), SendOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(second.received.load(Ordering::SeqCst), before + 4);
}

#[tokio::test]
async fn test_shutdown_tears_down_and_rejects_sends() {
    let node = spawn_echo_node(1).await;
    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![node.endpoint.clone()]);

    let _: Value = client
        .request("echo", Some(json!("before")), SendOptions::default())
        .await
        .unwrap();

    client.shutdown().await;

    let err = client
        .request::<Value, Value>("echo", Some(json!("after")), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ClusterDisconnected));

    // Pool gauges were deregistered on close
    let snapshot = client.stats_snapshot();
    assert!(snapshot.nodes[&1].gauges.is_none());
}

#[tokio::test]
async fn test_write_attempts_bounded_by_retry_budget() {
    let bad = spawn_refusing_node(1).await;
    let also_bad = spawn_refusing_node(2).await;

    let client = NetworkClient::round_robin(single_connection_config());
    client.update_endpoints(vec![bad.endpoint.clone(), also_bad.endpoint.clone()]);

    let options = SendOptions {
        max_retry: Some(2),
        ..Default::default()
    };
    let err = client
        .request::<Value, Value>("echo", Some(json!("doomed")), options)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // max_retry = 2 permits at most 3 attempts across both nodes
    let attempts =
        bad.accepted.load(Ordering::SeqCst) + also_bad.accepted.load(Ordering::SeqCst);
    assert!(attempts <= 3, "made {attempts} attempts");
    assert!(attempts >= 2);
}
