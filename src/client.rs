use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::auth::{self, Authenticator};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionLoop, ConnectionState};
use crate::error::{PusherError, Result};
use crate::event::{self, CallbackHandle, Event, SharedBindings};
use crate::transport::{Transport, WebSocketTransport};

/// Main client for connecting to a Pusher-protocol server.
///
/// Cheap to clone; all clones drive the same connection. The connection task
/// stops once the last clone is dropped.
#[derive(Clone)]
pub struct PusherClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    bindings: SharedBindings,
}

impl PusherClient {
    /// Create a client using the WebSocket transport and the authenticator the
    /// configuration implies. Does not connect.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut transport = WebSocketTransport::new();
        if let Some(proxy) = &config.proxy {
            transport = transport.with_proxy(proxy.clone());
        }
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client on top of a custom transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let authenticator = auth::from_config(&config);
        Self::with_parts(config, transport, authenticator)
    }

    /// Create a client with an explicit transport and authenticator
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PusherError::Config("a Tokio runtime is required to create a client".to_string())
        })?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let bindings = SharedBindings::default();
        let connection = ConnectionLoop::new(
            &config,
            transport,
            authenticator,
            receiver,
            commands.downgrade(),
            state_tx,
            Arc::clone(&bindings),
        )?;
        runtime.spawn(connection.run());

        debug!("Client created for app key {}", config.app_key);
        Ok(Self {
            commands,
            state,
            bindings,
        })
    }

    /// Start connecting. Returns immediately; watch `state_changes` to follow progress.
    pub async fn connect(&self) -> Result<()> {
        info!("Connect requested");
        self.commands
            .send(Command::Connect)
            .map_err(|_| PusherError::ClientClosed)
    }

    /// Close the connection and stop reconnecting. Channels stay registered
    /// and are subscribed again on the next `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnect requested");
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut changes = self.state.clone();
        changes
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| PusherError::ClientClosed)
    }

    /// Subscribe to a channel. Subscribing twice returns the same channel.
    ///
    /// If the channel's last authentication failed on the current socket, subscribing again
    /// retries it.
    pub async fn subscribe(&self, channel_name: &str) -> Result<Channel> {
        self.subscribe_inner(channel_name, None, None).await
    }

    /// Subscribe to a presence channel announcing `user_data` as the member info
    pub async fn subscribe_presence(
        &self,
        channel_name: &str,
        user_data: &serde_json::Value,
    ) -> Result<Channel> {
        let channel_data = serde_json::to_string(user_data)?;
        self.subscribe_inner(channel_name, Some(channel_data), None)
            .await
    }

    /// Subscribe with a token obtained out of band, skipping the authenticator
    pub async fn subscribe_with_auth(&self, channel_name: &str, auth: &str) -> Result<Channel> {
        self.subscribe_inner(channel_name, None, Some(auth.to_string()))
            .await
    }

    async fn subscribe_inner(
        &self,
        channel_name: &str,
        channel_data: Option<String>,
        auth: Option<String>,
    ) -> Result<Channel> {
        if channel_name.is_empty() {
            return Err(PusherError::Config("channel name must not be empty".to_string()));
        }
        debug!("Subscribing to channel: {}", channel_name);
        self.request(|reply| Command::Subscribe {
            name: channel_name.to_string(),
            channel_data,
            auth,
            reply,
        })
        .await
    }

    /// Unsubscribe from a channel. Unknown channels are ignored.
    pub async fn unsubscribe(&self, channel_name: &str) -> Result<()> {
        debug!("Unsubscribing from channel: {}", channel_name);
        self.request(|reply| Command::Unsubscribe {
            name: channel_name.to_string(),
            reply,
        })
        .await
    }

    /// Look up a registered channel
    pub async fn channel(&self, channel_name: &str) -> Result<Option<Channel>> {
        self.request(|reply| Command::Channel {
            name: channel_name.to_string(),
            reply,
        })
        .await
    }

    /// Send a raw event. Fails with `NotConnected` unless connected.
    pub async fn send(
        &self,
        event_name: &str,
        data: serde_json::Value,
        channel: Option<&str>,
    ) -> Result<()> {
        self.request(|reply| Command::Send {
            event: event_name.to_string(),
            data,
            channel: channel.map(str::to_string),
            reply,
        })
        .await?
    }

    /// Socket id of the current connection, if connected
    pub async fn socket_id(&self) -> Result<Option<String>> {
        self.request(|reply| Command::SocketId { reply }).await
    }

    /// Bind a callback to connection-level events such as `pusher:error`
    pub fn bind<F>(&self, event_name: &str, callback: F) -> CallbackHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        event::lock(&self.bindings).bind(event_name, Arc::new(callback))
    }

    pub fn unbind(&self, handle: CallbackHandle) -> bool {
        event::lock(&self.bindings).unbind(handle)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| PusherError::ClientClosed)?;
        response.await.map_err(|_| PusherError::ClientClosed)
    }
}

impl std::fmt::Debug for PusherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherClient")
            .field("state", &self.state())
            .finish()
    }
}

