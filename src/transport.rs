use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, client_async_tls, connect_async,
    tungstenite::protocol::Message,
};
use tracing::{debug, error, info, trace};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{PusherError, Result};

const MAX_PROXY_RESPONSE: usize = 8192;

/// Lifecycle and data notifications from an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed(Option<String>),
    Error(String),
}

/// Frames the connection asks the transport to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// One open socket: a sender for outbound frames and a receiver for inbound
/// events. Dropping the session aborts its reader and writer tasks.
pub struct TransportSession {
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Receiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task: None,
        }
    }

    fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        trace!("Sending frame: {}", text);
        self.outbound
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|e| PusherError::Transport(format!("send failed: {}", e)))
    }

    pub async fn close(&self) {
        if let Err(e) = self.outbound.try_send(OutboundFrame::Close) {
            debug!("Error sending close frame: {}", e);
        }
    }

    /// Next inbound event; `None` once the transport has gone away
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens sockets. The connection owns one transport and calls `open` for
/// every (re)connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportSession>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite, optionally tunnelled through an HTTP proxy
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    proxy: Option<ProxyConfig>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    async fn handshake(&self, url: &Url) -> Result<WsStream> {
        let (ws_stream, response) = match &self.proxy {
            None => connect_async(url.as_str()).await,
            Some(proxy) => {
                let stream = tunnel(proxy, url).await?;
                client_async_tls(url.as_str(), stream).await
            }
        }
        .map_err(|e| {
            error!("Failed to connect to WebSocket server: {}", e);
            e
        })?;

        debug!("Connected to WebSocket server. Response: {:?}", response.status());
        Ok(ws_stream)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportSession> {
        info!("Opening WebSocket to {}", url);
        let ws_stream = self.handshake(url).await?;

        let (sink, stream) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(100);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(100);

        let task = spawn_ws_tasks(sink, stream, out_rx, in_tx);
        Ok(TransportSession::new(out_tx, in_rx).with_task(task))
    }
}

/// Spawn WebSocket send and receive tasks
fn spawn_ws_tasks(
    sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut stream: futures_util::stream::SplitStream<WsStream>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()> {
    let sink = Arc::new(Mutex::new(sink));

    tokio::spawn(async move {
        // Dropping the set aborts both halves, including when this task is aborted
        let mut tasks = JoinSet::new();

        // Task for sending messages
        let sink_clone = Arc::clone(&sink);
        tasks.spawn(async move {
            while let Some(frame) = rx.recv().await {
                let (message, closing) = match frame {
                    OutboundFrame::Text(text) => (Message::Text(text), false),
                    OutboundFrame::Close => (Message::Close(None), true),
                };
                if let Err(e) = sink_clone.lock().await.send(message).await {
                    error!("Error sending message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            Half::Send
        });

        // Task for receiving messages
        let sink_clone = Arc::clone(&sink);
        let receive_events = events.clone();
        tasks.spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => {
                        trace!("Received message: {}", text);
                        TransportEvent::Message(text)
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = sink_clone.lock().await.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                        }
                        continue;
                    }
                    Ok(Message::Close(frame)) => {
                        TransportEvent::Closed(frame.map(|f| format!("{} {}", f.code, f.reason)))
                    }
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, TransportEvent::Message(_));
                if receive_events.send(event).await.is_err() || terminal {
                    return Half::Receive;
                }
            }
            let _ = receive_events.send(TransportEvent::Closed(None)).await;
            Half::Receive
        });

        match tasks.join_next().await {
            Some(Ok(Half::Send)) => {
                debug!("Send task completed");
                tasks.abort_all();
                let _ = events.send(TransportEvent::Closed(None)).await;
            }
            Some(Ok(Half::Receive)) => debug!("Receive task completed"),
            Some(Err(e)) => error!("WebSocket task failed: {}", e),
            None => {}
        }
    })
}

enum Half {
    Send,
    Receive,
}

/// Open a TCP connection through an HTTP proxy using CONNECT
async fn tunnel(proxy: &ProxyConfig, url: &Url) -> Result<TcpStream> {
    let host = url
        .host_str()
        .ok_or_else(|| PusherError::Transport(format!("no host in {}", url)))?;
    let port = url.port_or_known_default().unwrap_or(443);
    let io_err = |e: std::io::Error| PusherError::Transport(format!("proxy: {}", e));

    debug!("Tunnelling through proxy {}:{}", proxy.host, proxy.port);
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(io_err)?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(auth) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.map_err(io_err)?;

    let mut response = Vec::new();
    let mut buf = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            return Err(PusherError::Transport(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        response.extend_from_slice(&buf[..n]);
        if response.len() > MAX_PROXY_RESPONSE {
            return Err(PusherError::Transport("proxy response too large".to_string()));
        }
    }

    check_connect_response(&response)?;
    Ok(stream)
}

fn check_connect_response(response: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(response);
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    match status {
        Some("200") => Ok(()),
        _ => Err(PusherError::Transport(format!(
            "proxy refused CONNECT: {}",
            status_line
        ))),
    }
}
