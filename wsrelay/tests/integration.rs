//! End-to-end tests over real sockets.
//!
//! Each test starts a relay server on an ephemeral port backed by its own
//! in-memory store and drives it with real clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use wsrelay::{
    ClientConfig, Connection, ConnectionId, Frame, MemoryStore, RelayClient, RelayServer,
    ServerConfig, SessionState,
};

async fn start_test_server() -> (RelayServer, mpsc::UnboundedReceiver<Connection>) {
    let server = RelayServer::start(ServerConfig::for_testing(), Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    let connections = server.take_connection_rx().unwrap();
    (server, connections)
}

fn url(server: &RelayServer) -> String {
    format!("ws://{}", server.local_addr())
}

/// Connect a client and return it with its id as seen by the server.
async fn connect_client(
    server: &RelayServer,
    connections: &mut mpsc::UnboundedReceiver<Connection>,
) -> (RelayClient, ConnectionId) {
    let client = RelayClient::connect(ClientConfig::new(url(server)));
    client.wait_ready().await.unwrap();
    let conn = timeout(Duration::from_secs(2), connections.recv())
        .await
        .expect("server should report the connection")
        .unwrap();
    (client, conn.id().clone())
}

/// Forward every payload of `event` into a channel.
fn collect(client: &RelayClient, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(event, move |payload| {
        let _ = tx.send(payload.clone());
    });
    rx
}

async fn wait_subscribed(server: &RelayServer, id: &ConnectionId, event: &str) {
    timeout(Duration::from_secs(2), async {
        while !server.subscriptions_of(id).await.unwrap().iter().any(|e| e == event) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription should reach the server");
}

async fn wait_drained(server: &RelayServer) {
    timeout(Duration::from_secs(5), async {
        while server.remaining_pending_count().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every message should be acknowledged");
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("payload should arrive")
        .unwrap()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, mut connections) = start_test_server().await;

    let result = tokio_tungstenite::connect_async(url(&server)).await;
    assert!(result.is_ok(), "Should connect to server");

    let conn = timeout(Duration::from_secs(2), connections.recv()).await.unwrap().unwrap();
    assert_eq!(server.connection_ids().await.unwrap(), vec![conn.id().clone()]);
    server.close().await;
}

#[tokio::test]
async fn test_direct_send_is_acknowledged() {
    let (server, mut connections) = start_test_server().await;
    let (client, id) = connect_client(&server, &mut connections).await;
    let mut hello = collect(&client, "hello");

    server.send(&id, "hello", json!({"text": "hi"})).await.unwrap();

    assert_eq!(recv(&mut hello).await, json!({"text": "hi"}));
    wait_drained(&server).await;
    assert!(server.exhausted_message_ids().await.unwrap().is_empty());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_retries_never_reach_listener_twice() {
    let (server, mut connections) = start_test_server().await;
    let (client, id) = connect_client(&server, &mut connections).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.on("tick", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // One at a time: ids only ever grow, so each is accepted exactly once
    for n in 0..20 {
        server.send(&id, "tick", json!(n)).await.unwrap();
        wait_drained(&server).await;
    }
    // Leave time for any in-flight retry to land
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 20);
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_back_to_back_sends_all_reach_listener() {
    let (server, mut connections) = start_test_server().await;
    let (client, id) = connect_client(&server, &mut connections).await;
    let mut ticks = collect(&client, "tick");

    for n in 0..50 {
        server.send(&id, "tick", json!(n)).await.unwrap();
    }
    wait_drained(&server).await;

    for n in 0..50 {
        assert_eq!(recv(&mut ticks).await, json!(n));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.try_recv().is_err(), "no payload should arrive twice");
    assert!(server.exhausted_message_ids().await.unwrap().is_empty());
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_back_to_back_broadcasts_of_two_events() {
    let (server, mut connections) = start_test_server().await;
    let (client, id) = connect_client(&server, &mut connections).await;
    let mut alpha = collect(&client, "alpha");
    let mut beta = collect(&client, "beta");
    wait_subscribed(&server, &id, "alpha").await;
    wait_subscribed(&server, &id, "beta").await;

    for n in 0..10 {
        server.broadcast("alpha", json!(n)).await.unwrap();
        server.broadcast("beta", json!(n)).await.unwrap();
    }
    wait_drained(&server).await;

    for n in 0..10 {
        assert_eq!(recv(&mut alpha).await, json!(n));
        assert_eq!(recv(&mut beta).await, json!(n));
    }
    assert!(server.exhausted_message_ids().await.unwrap().is_empty());
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_filters_by_subscription() {
    let (server, mut connections) = start_test_server().await;
    let (subscriber, sub_id) = connect_client(&server, &mut connections).await;
    let (bystander, _) = connect_client(&server, &mut connections).await;

    let mut news = collect(&subscriber, "news");
    wait_subscribed(&server, &sub_id, "news").await;
    let (tx, mut unexpected) = mpsc::unbounded_channel::<Value>();
    bystander.on("other", move |v| {
        let _ = tx.send(v.clone());
    });

    let ids = server.broadcast("news", json!("extra")).await.unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(recv(&mut news).await, json!("extra"));
    assert!(timeout(Duration::from_millis(100), unexpected.recv()).await.is_err());

    wait_drained(&server).await;
    subscriber.close().await;
    bystander.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_send_to_room() {
    let (server, mut connections) = start_test_server().await;
    let (a, a_id) = connect_client(&server, &mut connections).await;
    let (b, b_id) = connect_client(&server, &mut connections).await;
    let (c, c_id) = connect_client(&server, &mut connections).await;

    let mut a_rx = collect(&a, "chat");
    let mut b_rx = collect(&b, "chat");
    let mut c_rx = collect(&c, "chat");
    for id in [&a_id, &b_id, &c_id] {
        wait_subscribed(&server, id, "chat").await;
    }
    server.join(&a_id, "lobby").await.unwrap();
    server.join(&b_id, "lobby").await.unwrap();

    let ids = server.send_to_room("lobby", "chat", json!({"m": 1})).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(recv(&mut a_rx).await, json!({"m": 1}));
    assert_eq!(recv(&mut b_rx).await, json!({"m": 1}));
    assert!(timeout(Duration::from_millis(100), c_rx.recv()).await.is_err());

    // Leaving and disconnecting both shrink the room
    server.leave(&a_id, "lobby").await.unwrap();
    b.close().await;
    timeout(Duration::from_secs(2), async {
        while !server.rooms_of(&b_id).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    wait_drained(&server).await;
    assert!(server.send_to_room("lobby", "chat", json!(2)).await.unwrap().is_empty());

    a.close().await;
    c.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_client_request_reaches_server_listener() {
    let (server, mut connections) = start_test_server().await;
    let client = RelayClient::connect(ClientConfig::new(url(&server)));
    client.wait_ready().await.unwrap();
    let conn = timeout(Duration::from_secs(2), connections.recv()).await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.on("msg", move |payload| {
        let _ = tx.send(payload.clone());
    });

    client.send("msg", json!({"name": "ann", "text": "hello"})).await.unwrap();
    assert_eq!(recv(&mut rx).await, json!({"name": "ann", "text": "hello"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_never_responding_client_exhausts_budget() {
    let (server, mut connections) = start_test_server().await;

    // Raw socket that reads requests but never answers them
    let (mut ws, _) = tokio_tungstenite::connect_async(url(&server)).await.unwrap();
    let conn = timeout(Duration::from_secs(2), connections.recv()).await.unwrap().unwrap();

    let message_id = server.send(conn.id(), "ping", json!(1)).await.unwrap();

    let mut received = 0;
    timeout(Duration::from_secs(5), async {
        while server.exhausted_message_ids().await.unwrap().is_empty() {
            if let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(5), ws.next()).await {
                if let Ok(Frame::Request { id, .. }) = Frame::from_ws(&msg) {
                    assert_eq!(id, message_id);
                    received += 1;
                }
            }
        }
    })
    .await
    .expect("retry budget should run out");

    assert!(received >= 2, "request should be retried, got {received}");
    assert_eq!(server.remaining_pending_count().await.unwrap(), 1);
    assert_eq!(server.exhausted_message_ids().await.unwrap(), vec![message_id.clone()]);

    // A late acknowledgment still settles it
    ws.send(Frame::response(message_id, "ping").to_ws().unwrap()).await.unwrap();
    wait_drained(&server).await;
    server.close().await;
}

#[tokio::test]
async fn test_clear_all() {
    let (server, mut connections) = start_test_server().await;
    let (_ws, _) = tokio_tungstenite::connect_async(url(&server)).await.unwrap();
    let conn = timeout(Duration::from_secs(2), connections.recv()).await.unwrap().unwrap();

    server.join(conn.id(), "lobby").await.unwrap();
    for _ in 0..3 {
        server.send(conn.id(), "ping", Value::Null).await.unwrap();
    }
    assert_eq!(server.remaining_pending_count().await.unwrap(), 3);

    server.clear_all().await.unwrap();
    assert_eq!(server.remaining_pending_count().await.unwrap(), 0);
    assert!(server.rooms_of(conn.id()).await.unwrap().is_empty());
    assert_eq!(server.connection_ids().await.unwrap().len(), 1);
    server.close().await;
}

#[tokio::test]
async fn test_client_reconnects_after_abnormal_close() {
    // First listener drops the socket without a close handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let flaky = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ws);
    });

    let config = ClientConfig {
        reconnect_interval: Duration::from_millis(50),
        ..ClientConfig::new(format!("ws://{addr}"))
    };
    let client = RelayClient::connect(config);
    let mut news = collect(&client, "news");
    let mut closes = collect(&client, "close");
    let mut reconnects = collect(&client, "reconnect");
    client.wait_ready().await.unwrap();
    flaky.await.unwrap();
    recv(&mut closes).await;

    // The relay takes over the same address
    let server = RelayServer::start(
        ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::for_testing()
        },
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();
    let mut connections = server.take_connection_rx().unwrap();

    timeout(Duration::from_secs(5), reconnects.recv()).await.unwrap().unwrap();
    assert_eq!(client.state(), SessionState::Open);
    let conn = timeout(Duration::from_secs(2), connections.recv()).await.unwrap().unwrap();

    // Subscriptions are declared again on the new connection
    wait_subscribed(&server, conn.id(), "news").await;
    server.broadcast("news", json!("back")).await.unwrap();
    assert_eq!(recv(&mut news).await, json!("back"));

    client.close().await;
    assert_eq!(client.state(), SessionState::Closed);
    server.close().await;
}
