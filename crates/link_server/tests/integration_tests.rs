//! Integration tests for the socket relay over real loopback websockets.
//!
//! Covers both relay modes: listening for peers behind an allow-list, and
//! keeping an outbound connection to a hub alive.

use futures::{SinkExt, StreamExt};
use link_server::config::{AllowList, SocketConfig, SocketMode};
use link_server::relay::SocketRelay;
use link_server::{DomainEvent, EventKind};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};

const WAIT: Duration = Duration::from_secs(10);

/// Starts a listening relay on an ephemeral loopback port.
async fn listening_relay(allow: AllowList) -> (Arc<SocketRelay>, SocketAddr, broadcast::Sender<()>) {
    let bind_address: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let relay = Arc::new(SocketRelay::new(SocketConfig {
        mode: SocketMode::Listen { bind_address },
        allow,
        ..SocketConfig::default()
    }));

    let listener = relay.bind(bind_address).unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);

    let server = relay.clone();
    tokio::spawn(async move { server.serve(listener, rx).await });

    (relay, addr, shutdown)
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn weather() -> DomainEvent {
    DomainEvent::new(EventKind::Weather, json!({"previous": 0, "new": 1}))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_and_broadcast() {
    let (relay, addr, shutdown) = listening_relay(AllowList::All).await;
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    client
        .send(Message::text(r#"{"type":2,"body":["Weather"]}"#))
        .await
        .unwrap();
    wait_until(|| relay.subscriptions().subscribers("Weather").len() == 1).await;

    assert_eq!(relay.broadcast(&weather()), 1);
    assert_eq!(relay.broadcast(&DomainEvent::new(EventKind::Death, Value::Null)), 0);

    let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "type": 2,
            "body": {"event": "Weather", "type": 6, "data": {"previous": 0, "new": 1}}
        })
    );

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsubscribe_stops_delivery() {
    let (relay, addr, shutdown) = listening_relay(AllowList::All).await;
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    client
        .send(Message::text(r#"{"type":2,"body":["Weather","Death"]}"#))
        .await
        .unwrap();
    wait_until(|| relay.subscriptions().subscribers("Death").len() == 1).await;

    client
        .send(Message::text(r#"{"type":3,"body":["Weather"]}"#))
        .await
        .unwrap();
    wait_until(|| relay.subscriptions().subscribers("Weather").is_empty()).await;

    assert_eq!(relay.broadcast(&weather()), 0);
    assert_eq!(relay.subscriptions().subscribers("Death").len(), 1);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_frames_do_not_drop_the_peer() {
    let (relay, addr, shutdown) = listening_relay(AllowList::All).await;
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    client.send(Message::text("definitely not json")).await.unwrap();
    client.send(Message::text(r#"{"type":42,"body":[]}"#)).await.unwrap();
    client
        .send(Message::text(r#"{"type":2,"body":["Explosion"]}"#))
        .await
        .unwrap();

    wait_until(|| relay.subscriptions().subscribers("Explosion").len() == 1).await;
    assert_eq!(relay.peers().len(), 1);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_clears_subscriptions() {
    let (relay, addr, shutdown) = listening_relay(AllowList::All).await;
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    client
        .send(Message::text(r#"{"type":2,"body":["Weather","Death"]}"#))
        .await
        .unwrap();
    wait_until(|| relay.subscriptions().subscribers("Death").len() == 1).await;

    client.close(None).await.unwrap();
    wait_until(|| relay.peers().is_empty()).await;

    assert!(relay.subscriptions().subscribers("Weather").is_empty());
    assert!(relay.subscriptions().subscribers("Death").is_empty());
    assert_eq!(relay.broadcast(&weather()), 0);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allow_list_rejects_unlisted_origin() {
    let allow = AllowList::Only(HashSet::from([IpAddr::from([10, 0, 0, 1])]));
    let (relay, addr, shutdown) = listening_relay(allow).await;

    let attempt = timeout(WAIT, connect_async(format!("ws://{addr}"))).await.unwrap();
    assert!(attempt.is_err());
    assert!(relay.peers().is_empty());

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_commands_are_forwarded() {
    let (relay, addr, shutdown) = listening_relay(AllowList::All).await;
    let mut commands = relay.take_commands().unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    client
        .send(Message::text(r#"{"type":1,"body":"weather clear"}"#))
        .await
        .unwrap();

    let command = timeout(WAIT, commands.recv()).await.unwrap().unwrap();
    assert_eq!(command, "weather clear");

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_mode_reconnects() {
    let hub = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = hub.local_addr().unwrap();

    let relay = Arc::new(SocketRelay::new(SocketConfig {
        mode: SocketMode::Connect {
            host: "127.0.0.1".to_string(),
            port: hub_addr.port(),
        },
        reconnect_delay: Duration::from_millis(100),
        allow: AllowList::All,
    }));
    let mut commands = relay.take_commands().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let runner = relay.clone();
    let task = tokio::spawn(async move { runner.run(rx).await });

    // First connection: push a command, then hang up.
    let (stream, _) = timeout(WAIT, hub.accept()).await.unwrap().unwrap();
    let mut first = accept_async(stream).await.unwrap();
    first
        .send(Message::text(r#"{"type":1,"body":"say first"}"#))
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, commands.recv()).await.unwrap().unwrap(),
        "say first"
    );
    drop(first);

    // The relay comes back on its own.
    let (stream, _) = timeout(WAIT, hub.accept()).await.unwrap().unwrap();
    let mut second = accept_async(stream).await.unwrap();
    second
        .send(Message::text(r#"{"type":2,"body":["Weather"]}"#))
        .await
        .unwrap();
    wait_until(|| relay.subscriptions().subscribers("Weather").len() == 1).await;
    assert_eq!(relay.broadcast(&weather()), 1);

    let frame = timeout(WAIT, second.next()).await.unwrap().unwrap().unwrap();
    let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["body"]["event"], "Weather");

    let _ = shutdown.send(());
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}
