mod common;

use std::time::Duration;

use pusher_rs::{ConnectionState, OutboundFrame, PusherClient, ReconnectPolicy};
use serde_json::json;
use tokio::time::Instant;

use common::*;

fn heartbeat_config() -> pusher_rs::ClientConfig {
    config()
        .with_activity_timeout(Duration::from_secs(10))
        .with_pong_timeout(Duration::from_secs(5))
        .with_reconnect_policy(ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::ZERO,
        ))
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_pinged_then_dropped_without_a_pong() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport).unwrap();
    let mut socket = connected(&client, &mut sockets, "1.1").await;
    let start = Instant::now();

    assert_eq!(
        socket.next_frame().await,
        json!({"event": "pusher:ping", "data": {}})
    );
    assert_elapsed(start, Duration::from_secs(10));

    // No pong: the socket is closed and a new one opened after the backoff
    assert_eq!(socket.next_outbound().await, Some(OutboundFrame::Close));
    assert_elapsed(start, Duration::from_secs(15));

    let socket = next_socket(&mut sockets).await;
    assert_elapsed(start, Duration::from_secs(16));
    socket.establish("2.2").await;
    wait_for(&client, ConnectionState::Connected).await;
    assert_eq!(client.socket_id().await.unwrap().as_deref(), Some("2.2"));
}

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_the_connection() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport.clone()).unwrap();
    let mut socket = connected(&client, &mut sockets, "1.1").await;
    let start = Instant::now();

    for round in 1..=3u32 {
        let frame = socket.next_frame().await;
        assert_eq!(frame["event"], "pusher:ping");
        assert_elapsed(start, Duration::from_secs(10) * round);
        socket.push(json!({"event": "pusher:pong", "data": {}})).await;
    }

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_activity_timeout_shortens_the_ping_interval() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport).unwrap();
    client.connect().await.unwrap();
    let mut socket = next_socket(&mut sockets).await;
    socket
        .push(json!({
            "event": "pusher:connection_established",
            "data": json!({"socket_id": "1.1", "activity_timeout": 3}).to_string()
        }))
        .await;
    wait_for(&client, ConnectionState::Connected).await;
    let start = Instant::now();

    assert_eq!(socket.next_frame().await["event"], "pusher:ping");
    assert_elapsed(start, Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_back_off_exponentially() {
    let (transport, mut sockets) = MockTransport::new();
    transport.fail_next(3);
    let client = PusherClient::with_transport(heartbeat_config(), transport.clone()).unwrap();
    let start = Instant::now();

    client.connect().await.unwrap();
    let socket = next_socket(&mut sockets).await;
    // 1s + 2s + 4s between the four attempts
    assert_elapsed(start, Duration::from_secs(7));
    assert_eq!(transport.attempts(), 4);
    assert_eq!(client.state(), ConnectionState::Connecting);

    socket.establish("1.1").await;
    wait_for(&client, ConnectionState::Connected).await;

    // A successful connection resets the backoff
    socket.close().await;
    let reconnect_started = Instant::now();
    next_socket(&mut sockets).await;
    assert_elapsed(reconnect_started, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn missing_handshake_is_treated_as_a_failed_attempt() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport).unwrap();
    let start = Instant::now();

    client.connect().await.unwrap();
    let mut silent = next_socket(&mut sockets).await;
    assert_eq!(silent.next_outbound().await, Some(OutboundFrame::Close));
    assert_elapsed(start, Duration::from_secs(5));

    next_socket(&mut sockets).await;
    assert_elapsed(start, Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn fatal_server_errors_stop_reconnecting() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport.clone()).unwrap();
    let socket = connected(&client, &mut sockets, "1.1").await;

    socket
        .push(json!({
            "event": "pusher:error",
            "data": {"code": 4001, "message": "Application does not exist"}
        }))
        .await;
    wait_for(&client, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(sockets.try_recv().is_err());
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn over_capacity_errors_back_off_as_unavailable() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport).unwrap();
    let mut states = client.state_changes();
    let socket = connected(&client, &mut sockets, "1.1").await;
    states.borrow_and_update();

    socket
        .push(json!({
            "event": "pusher:error",
            "data": {"code": 4100, "message": "Over capacity"}
        }))
        .await;
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Unavailable);

    let start = Instant::now();
    next_socket(&mut sockets).await;
    assert_elapsed(start, Duration::from_secs(1));
    assert_eq!(client.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn reconnect_now_errors_skip_the_backoff() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport).unwrap();
    let socket = connected(&client, &mut sockets, "1.1").await;
    let start = Instant::now();

    socket
        .push(json!({
            "event": "pusher:error",
            "data": json!({"code": 4200, "message": "Generic reconnect immediately"}).to_string()
        }))
        .await;
    next_socket(&mut sockets).await;
    assert_elapsed(start, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_reconnect() {
    let (transport, mut sockets) = MockTransport::new();
    let client = PusherClient::with_transport(heartbeat_config(), transport.clone()).unwrap();
    let socket = connected(&client, &mut sockets, "1.1").await;

    socket.close().await;
    wait_for(&client, ConnectionState::Reconnecting).await;
    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(sockets.try_recv().is_err());
    assert_eq!(transport.attempts(), 1);
}
