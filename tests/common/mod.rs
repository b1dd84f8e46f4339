#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pusher_rs::{
    ClientConfig, ConnectionState, OutboundFrame, PusherClient, PusherError, ReconnectPolicy,
    Transport, TransportEvent, TransportSession,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

/// Generous so paused-clock tests reach the connection's own timers first
pub const WAIT: Duration = Duration::from_secs(30);

/// Transport whose sockets are driven by the test
#[derive(Default)]
pub struct MockTransport {
    sockets: Mutex<Option<mpsc::UnboundedSender<MockSocket>>>,
    failures: AtomicUsize,
    opened: AtomicUsize,
    urls: Mutex<Vec<Url>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            sockets: Mutex::new(Some(tx)),
            ..Default::default()
        };
        (Arc::new(transport), rx)
    }

    /// Fail the next `count` open attempts
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> pusher_rs::Result<TransportSession> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PusherError::Transport("connection refused".to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let socket = MockSocket {
            sent: outbound_rx,
            server: inbound_tx,
        };
        if let Some(sockets) = self.sockets.lock().unwrap().as_ref() {
            let _ = sockets.send(socket);
        }
        Ok(TransportSession::new(outbound_tx, inbound_rx))
    }
}

/// Server side of one mock socket
pub struct MockSocket {
    pub sent: mpsc::Receiver<OutboundFrame>,
    pub server: mpsc::Sender<TransportEvent>,
}

impl MockSocket {
    pub async fn push(&self, frame: Value) {
        self.server
            .send(TransportEvent::Message(frame.to_string()))
            .await
            .expect("connection dropped the socket");
    }

    /// Greet the client the way the server does, with double-encoded data
    pub async fn establish(&self, socket_id: &str) {
        let data = json!({ "socket_id": socket_id, "activity_timeout": 120 }).to_string();
        self.push(json!({ "event": "pusher:connection_established", "data": data }))
            .await;
    }

    pub async fn ack(&self, channel: &str) {
        self.push(json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": channel,
            "data": "{}"
        }))
        .await;
    }

    pub async fn close(&self) {
        let _ = self
            .server
            .send(TransportEvent::Closed(Some("going away".to_string())))
            .await;
    }

    /// Next text frame written by the client, parsed as JSON
    pub async fn next_frame(&mut self) -> Value {
        match tokio::time::timeout(WAIT, self.sent.recv()).await {
            Ok(Some(OutboundFrame::Text(text))) => serde_json::from_str(&text).unwrap(),
            Ok(Some(OutboundFrame::Close)) => panic!("expected a text frame, got close"),
            Ok(None) => panic!("socket dropped"),
            Err(_) => panic!("no frame within {:?}", WAIT),
        }
    }

    /// Next outbound frame of any kind, `None` once the client dropped the socket
    pub async fn next_outbound(&mut self) -> Option<OutboundFrame> {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("no outbound activity")
    }

    /// True when nothing was written within `window`
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.sent.recv()).await.is_err()
    }
}

/// Logs show up with `RUST_LOG=pusher_rs=debug cargo test -- --nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> ClientConfig {
    init_tracing();
    ClientConfig::new("app-key")
        .with_host("localhost")
        .with_secure(false)
        .with_reconnect_policy(ReconnectPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::ZERO,
        ))
}

pub async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<MockSocket>) -> MockSocket {
    tokio::time::timeout(WAIT, sockets.recv())
        .await
        .expect("no connection attempt")
        .expect("transport dropped")
}

pub async fn wait_for(client: &PusherClient, state: ConnectionState) {
    tokio::time::timeout(WAIT, client.wait_for_state(state))
        .await
        .expect("state not reached")
        .unwrap();
}

/// Connect and complete the handshake
pub async fn connected(
    client: &PusherClient,
    sockets: &mut mpsc::UnboundedReceiver<MockSocket>,
    socket_id: &str,
) -> MockSocket {
    client.connect().await.unwrap();
    let socket = next_socket(sockets).await;
    socket.establish(socket_id).await;
    wait_for(client, ConnectionState::Connected).await;
    socket
}

/// Paused-clock timings land on millisecond ticks
pub fn assert_elapsed(start: tokio::time::Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected {:?}, got {:?}",
        expected,
        elapsed
    );
}

pub fn subscribe_target(frame: &Value) -> &str {
    assert_eq!(frame["event"], "pusher:subscribe", "unexpected frame {}", frame);
    frame["data"]["channel"].as_str().unwrap()
}
