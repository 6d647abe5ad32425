//! End-to-end tests over a real WebSocket.
//!
//! Run with: cargo test --test websocket --features sqlite
//!
//! Workers are started in-process on ephemeral ports. Cross-worker tests share
//! one SQLite file and one broadcast channel, standing in for two processes.

use std::sync::Arc;
use std::time::Duration;

use chorus::bus::{BroadcastBus, ChannelBus};
use chorus::config::{Config, StorageType};
use chorus::storage::{init_storage, MessageStore};
use chorus::transport::{ServerFrame, SessionId};
use chorus::worker::{self, WorkerHandle};
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect(handle: &WorkerHandle, query: &str) -> Socket {
    let url = format!("ws://{}/ws{}", handle.addr, query);
    let (socket, _) = connect_async(url).await.expect("handshake");
    socket
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("server frame");
        }
    }
}

/// Read the welcome frame and return its session.
async fn welcome(socket: &mut Socket) -> (SessionId, bool) {
    match next_frame(socket).await {
        ServerFrame::Welcome { session, recovered } => (session, recovered),
        other => panic!("expected welcome, got {:?}", other),
    }
}

async fn publish(socket: &mut Socket, content: &str, token: &str, ack: u64) {
    let frame = serde_json::json!({
        "type": "publish",
        "content": content,
        "token": token,
        "ack": ack,
    });
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send publish");
}

/// Read frames until both the ack `ack` and a message frame arrive, in either order.
async fn ack_and_message(socket: &mut Socket, ack: u64) -> (String, i64) {
    let mut acked = false;
    let mut message = None;
    while !acked || message.is_none() {
        match next_frame(socket).await {
            ServerFrame::Ack { ack: Some(id) } if id == ack => acked = true,
            ServerFrame::Message { content, offset } => message = Some((content, offset)),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    message.expect("message frame")
}

async fn expect_message(socket: &mut Socket) -> (String, i64) {
    match next_frame(socket).await {
        ServerFrame::Message { content, offset } => (content, offset),
        other => panic!("expected message, got {:?}", other),
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn sqlite_config(dir: &TempDir) -> Config {
    let mut config = Config::for_test();
    config.storage.storage_type = StorageType::Sqlite;
    config.storage.sqlite.path = dir.path().join("chat.db").to_string_lossy().to_string();
    config
}

#[tokio::test]
async fn test_publish_is_acked_and_broadcast_to_every_client() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    let mut alice = connect(&handle, "").await;
    let mut bob = connect(&handle, "").await;
    welcome(&mut alice).await;
    welcome(&mut bob).await;

    publish(&mut alice, "hello", "tok-1", 7).await;

    assert_eq!(ack_and_message(&mut alice, 7).await, ("hello".to_string(), 1));
    assert_eq!(expect_message(&mut bob).await, ("hello".to_string(), 1));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_is_acked_without_second_broadcast() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    let mut alice = connect(&handle, "").await;
    let mut bob = connect(&handle, "").await;
    welcome(&mut alice).await;
    welcome(&mut bob).await;

    publish(&mut alice, "hello", "tok-1", 1).await;
    ack_and_message(&mut alice, 1).await;

    publish(&mut alice, "hello", "tok-1", 2).await;
    match next_frame(&mut alice).await {
        ServerFrame::Ack { ack } => assert_eq!(ack, Some(2)),
        other => panic!("expected ack, got {:?}", other),
    }

    publish(&mut alice, "next", "tok-2", 3).await;
    ack_and_message(&mut alice, 3).await;

    // Bob sees offsets 1 and 2 only; the retry produced nothing.
    assert_eq!(expect_message(&mut bob).await, ("hello".to_string(), 1));
    assert_eq!(expect_message(&mut bob).await, ("next".to_string(), 2));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_with_offset_catches_up() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    for content in ["one", "two", "three"] {
        handle.service().publish(content, None).await;
    }

    let mut late = connect(&handle, "?offset=1").await;
    let (_, recovered) = welcome(&mut late).await;

    assert!(!recovered);
    assert_eq!(expect_message(&mut late).await, ("two".to_string(), 2));
    assert_eq!(expect_message(&mut late).await, ("three".to_string(), 3));

    handle.service().publish("four", None).await;
    assert_eq!(expect_message(&mut late).await, ("four".to_string(), 4));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_recovery_replays_missed_broadcasts() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    let registry = handle.recovery().expect("recovery enabled").clone();

    let mut first = connect(&handle, "").await;
    let (session, _) = welcome(&mut first).await;
    handle.service().publish("seen", None).await;
    assert_eq!(expect_message(&mut first).await, ("seen".to_string(), 1));

    first.close(None).await.unwrap();
    drop(first);
    eventually(|| {
        let registry = registry.clone();
        async move { registry.len().await == 1 }
    })
    .await;

    handle.service().publish("missed", None).await;

    let mut resumed = connect(&handle, &format!("?offset=1&session={session}")).await;
    let (resumed_session, recovered) = welcome(&mut resumed).await;

    assert!(recovered);
    assert_eq!(resumed_session, session);
    assert_eq!(expect_message(&mut resumed).await, ("missed".to_string(), 2));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_session_falls_back_to_catch_up() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    handle.service().publish("stored", None).await;

    let mut client = connect(&handle, &format!("?session={}", SessionId::new())).await;
    let (_, recovered) = welcome(&mut client).await;

    assert!(!recovered);
    assert_eq!(expect_message(&mut client).await, ("stored".to_string(), 1));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cross_worker_broadcast_and_dedup() {
    let dir = TempDir::new().unwrap();
    let config = sqlite_config(&dir);

    let store_a: Arc<dyn MessageStore> = init_storage(&config.storage).await.unwrap();
    let store_b: Arc<dyn MessageStore> = init_storage(&config.storage).await.unwrap();
    let bus_a = ChannelBus::new();
    let bus_b: Arc<dyn BroadcastBus> = Arc::new(bus_a.attach());
    let bus_a: Arc<dyn BroadcastBus> = Arc::new(bus_a);

    let worker_a = worker::spawn_with(&config, 0, store_a, bus_a).await.unwrap();
    let worker_b = worker::spawn_with(&config, 1, store_b, bus_b).await.unwrap();

    let mut on_a = connect(&worker_a, "").await;
    let mut on_b = connect(&worker_b, "").await;
    welcome(&mut on_a).await;
    welcome(&mut on_b).await;

    publish(&mut on_a, "hi", "t1", 1).await;
    assert_eq!(ack_and_message(&mut on_a, 1).await, ("hi".to_string(), 1));
    assert_eq!(expect_message(&mut on_b).await, ("hi".to_string(), 1));

    // The client retries through the other worker: stored once, acked anyway.
    publish(&mut on_b, "hi", "t1", 2).await;
    match next_frame(&mut on_b).await {
        ServerFrame::Ack { ack } => assert_eq!(ack, Some(2)),
        other => panic!("expected ack, got {:?}", other),
    }

    publish(&mut on_b, "bye", "t2", 3).await;
    assert_eq!(ack_and_message(&mut on_b, 3).await, ("bye".to_string(), 2));
    assert_eq!(expect_message(&mut on_a).await, ("bye".to_string(), 2));

    worker_a.shutdown().await.unwrap();
    worker_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_ignored() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();
    let mut client = connect(&handle, "").await;
    welcome(&mut client).await;

    client
        .send(Message::Text("{\"type\":\"nonsense\"}".to_string()))
        .await
        .unwrap();
    publish(&mut client, "still here", "tok-1", 1).await;

    assert_eq!(
        ack_and_message(&mut client, 1).await,
        ("still here".to_string(), 1)
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_endpoint() {
    let handle = worker::spawn(&Config::for_test(), 0).await.unwrap();

    let mut stream = TcpStream::connect(handle.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));

    handle.shutdown().await.unwrap();
}
