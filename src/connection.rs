use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::{AuthData, AuthRequest, Authenticator};
use crate::backoff::ReconnectPolicy;
use crate::channel::{Channel, ChannelKind};
use crate::config::ClientConfig;
use crate::error::{PusherError, Result};
use crate::event::{self, Event, SharedBindings};
use crate::message::{
    self, ConnectionData, ErrorAction, ErrorData, Inbound, PusherMessage,
};
use crate::registry::ChannelRegistry;
use crate::transport::{Transport, TransportEvent, TransportSession};

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The server asked us to back off before reconnecting
    Unavailable,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unavailable => "unavailable",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Requests handed from application code to the connection loop
pub(crate) enum Command {
    Connect,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        name: String,
        channel_data: Option<String>,
        auth: Option<String>,
        reply: oneshot::Sender<Channel>,
    },
    Unsubscribe {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Send {
        event: String,
        data: serde_json::Value,
        channel: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Channel {
        name: String,
        reply: oneshot::Sender<Option<Channel>>,
    },
    SocketId {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Completion of an authentication request, correlated by id and epoch
struct AuthOutcome {
    id: u64,
    epoch: u64,
    channel: String,
    result: Result<AuthData>,
}

struct PendingAuth {
    id: u64,
    task: JoinHandle<()>,
}

/// The single task that owns the socket, the connection state and the channel
/// registry. Everything else talks to it through `Command`s.
pub(crate) struct ConnectionLoop {
    url: Url,
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn Authenticator>>,
    default_user_data: Option<String>,

    commands: mpsc::UnboundedReceiver<Command>,
    weak_commands: mpsc::WeakUnboundedSender<Command>,
    state_tx: watch::Sender<ConnectionState>,
    bindings: SharedBindings,

    state: ConnectionState,
    socket_id: Option<String>,
    /// Bumped whenever a socket is torn down; late results from older sockets are ignored
    epoch: u64,
    registry: ChannelRegistry,

    session: Option<TransportSession>,
    opening: Option<JoinHandle<Result<TransportSession>>>,

    pending_auth: HashMap<String, PendingAuth>,
    /// Restricted channels whose last authentication failed on this socket
    failed_auth: HashSet<String>,
    next_auth_id: u64,
    auth_tx: mpsc::UnboundedSender<AuthOutcome>,
    auth_rx: mpsc::UnboundedReceiver<AuthOutcome>,

    reconnect: ReconnectPolicy,
    reconnect_at: Option<Instant>,

    activity_timeout: Duration,
    current_activity_timeout: Duration,
    pong_timeout: Duration,
    heartbeat_at: Option<Instant>,
    awaiting_pong: bool,
}

impl ConnectionLoop {
    pub(crate) fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
        commands: mpsc::UnboundedReceiver<Command>,
        weak_commands: mpsc::WeakUnboundedSender<Command>,
        state_tx: watch::Sender<ConnectionState>,
        bindings: SharedBindings,
    ) -> Result<Self> {
        let default_user_data = config
            .user_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        Ok(Self {
            url: config.url()?,
            transport,
            authenticator,
            default_user_data,
            commands,
            weak_commands,
            state_tx,
            bindings,
            state: ConnectionState::Disconnected,
            socket_id: None,
            epoch: 0,
            registry: ChannelRegistry::default(),
            session: None,
            opening: None,
            pending_auth: HashMap::new(),
            failed_auth: HashSet::new(),
            next_auth_id: 0,
            auth_tx,
            auth_rx,
            reconnect: config.reconnect.clone(),
            reconnect_at: None,
            activity_timeout: config.activity_timeout,
            current_activity_timeout: config.activity_timeout,
            pong_timeout: config.pong_timeout,
            heartbeat_at: None,
            awaiting_pong: false,
        })
    }

    pub(crate) async fn run(mut self) {
        debug!("Connection loop started for {}", self.url);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                opened = wait_opened(&mut self.opening) => self.on_opened(opened).await,
                event = next_transport_event(&mut self.session) => {
                    self.on_transport_event(event).await
                }
                Some(outcome) = self.auth_rx.recv() => self.on_auth_outcome(outcome).await,
                _ = sleep_until(deadline) => self.on_timer().await,
            }
        }

        debug!("All client handles dropped, stopping connection loop");
        self.go_disconnected().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state: {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.state == ConnectionState::Disconnected {
                    self.reconnect.reset();
                    self.start_connecting();
                } else {
                    debug!("connect() ignored, state is {}", self.state);
                }
            }
            Command::Disconnect { reply } => {
                self.go_disconnected().await;
                let _ = reply.send(());
            }
            Command::Subscribe {
                name,
                channel_data,
                auth,
                reply,
            } => {
                let channel = self.subscribe(&name, channel_data, auth).await;
                let _ = reply.send(channel);
            }
            Command::Unsubscribe { name, reply } => {
                self.unsubscribe(&name).await;
                let _ = reply.send(());
            }
            Command::Send {
                event,
                data,
                channel,
                reply,
            } => {
                let result = self.send_event(&event, data, channel.as_deref()).await;
                let _ = reply.send(result);
            }
            Command::Channel { name, reply } => {
                let _ = reply.send(self.registry.get(&name).cloned());
            }
            Command::SocketId { reply } => {
                let _ = reply.send(self.socket_id.clone());
            }
        }
    }

    fn start_connecting(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        info!("Connecting to {}", url);
        self.opening = Some(tokio::spawn(async move { transport.open(&url).await }));
    }

    async fn on_opened(&mut self, opened: Result<TransportSession>) {
        self.opening = None;
        match opened {
            Ok(session) => {
                debug!("Transport open, waiting for connection_established");
                self.session = Some(session);
                // The server must greet us within the pong window
                self.awaiting_pong = true;
                self.heartbeat_at = Some(Instant::now() + self.pong_timeout);
            }
            Err(e) => {
                warn!("Failed to open transport: {}", e);
                self.schedule_reconnect(ConnectionState::Reconnecting, None);
            }
        }
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => {
                self.note_activity();
                self.on_frame(&text).await;
            }
            Some(TransportEvent::Closed(reason)) => {
                info!("Connection closed: {}", reason.as_deref().unwrap_or("no reason"));
                self.connection_lost(ConnectionState::Reconnecting, None).await;
            }
            Some(TransportEvent::Error(e)) => {
                warn!("Transport error: {}", e);
                self.connection_lost(ConnectionState::Reconnecting, None).await;
            }
            None => {
                info!("Transport went away");
                self.connection_lost(ConnectionState::Reconnecting, None).await;
            }
        }
    }

    fn note_activity(&mut self) {
        self.awaiting_pong = false;
        if self.state == ConnectionState::Connected {
            self.heartbeat_at = Some(Instant::now() + self.current_activity_timeout);
        }
    }

    async fn on_frame(&mut self, text: &str) {
        let message = match PusherMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };
        let event = Event::from_message(&message);
        let inbound = match Inbound::classify(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::ConnectionEstablished(data) => {
                self.on_connection_established(data).await;
                event::dispatch(&self.bindings, &event);
            }
            Inbound::Ping => {
                if let Err(e) = self.send_frame(message::pong_frame()).await {
                    warn!("Failed to send pong: {}", e);
                }
                event::dispatch(&self.bindings, &event);
            }
            Inbound::Pong => {
                debug!("Pong received");
                event::dispatch(&self.bindings, &event);
            }
            Inbound::Error(data, _) => {
                event::dispatch(&self.bindings, &event);
                self.on_server_error(data).await;
            }
            Inbound::SubscriptionSucceeded(channel, _) => {
                debug!("Subscription succeeded for channel: {}", channel);
                self.registry.confirm(&channel, &event);
            }
            Inbound::SubscriptionError(channel, _) => {
                warn!("Subscription rejected for channel: {}", channel);
                if let Some(target) = self.registry.get(&channel) {
                    target.set_subscribed(false);
                    target.dispatch_error(&PusherError::SubscriptionError {
                        channel: channel.clone(),
                        message: event.data.clone(),
                    });
                }
            }
            Inbound::ChannelEvent(channel, _) => {
                debug!("Channel event: {} on {}", event.name, channel);
                self.registry.deliver(&channel, event);
            }
            Inbound::ConnectionEvent(_) => {
                event::dispatch(&self.bindings, &event);
            }
        }
    }

    async fn on_connection_established(&mut self, data: ConnectionData) {
        info!("Connection established with socket ID: {}", data.socket_id);
        self.socket_id = Some(data.socket_id);
        self.reconnect.reset();
        self.reconnect_at = None;

        self.current_activity_timeout = match data.activity_timeout {
            Some(secs) if secs > 0 => self.activity_timeout.min(Duration::from_secs(secs)),
            _ => self.activity_timeout,
        };
        self.awaiting_pong = false;
        self.heartbeat_at = Some(Instant::now() + self.current_activity_timeout);
        self.set_state(ConnectionState::Connected);

        if self.registry.len() > 0 {
            debug!("Subscribing {} channel(s)", self.registry.len());
        }
        for channel in self.registry.channels() {
            self.begin_subscribe(&channel).await;
        }
    }

    async fn on_server_error(&mut self, data: ErrorData) {
        error!(
            "Pusher error: {} (code: {:?})",
            data.message, data.code
        );
        match data.action() {
            ErrorAction::Disconnect => {
                info!("Error is unrecoverable, disconnecting");
                self.go_disconnected().await;
            }
            ErrorAction::ReconnectLater => {
                self.connection_lost(ConnectionState::Unavailable, None).await;
            }
            ErrorAction::ReconnectNow => {
                self.connection_lost(ConnectionState::Reconnecting, Some(Duration::ZERO))
                    .await;
            }
            ErrorAction::Report => {}
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.start_connecting();
        }

        if self.heartbeat_at.is_some_and(|at| at <= now) {
            if self.awaiting_pong {
                warn!("{}", PusherError::HeartbeatTimeout);
                self.connection_lost(ConnectionState::Reconnecting, None).await;
            } else {
                debug!("Sending ping");
                self.awaiting_pong = true;
                self.heartbeat_at = Some(now + self.pong_timeout);
                if let Err(e) = self.send_frame(message::ping_frame()).await {
                    warn!("Failed to send ping: {}", e);
                }
            }
        }
    }

    /// Drop the current socket and everything tied to it
    async fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.epoch += 1;
        self.socket_id = None;
        self.heartbeat_at = None;
        self.awaiting_pong = false;
        self.registry.mark_all_unsubscribed();
        for (name, pending) in self.pending_auth.drain() {
            debug!("Cancelling authentication for {}", name);
            pending.task.abort();
        }
        self.failed_auth.clear();
    }

    async fn connection_lost(&mut self, next: ConnectionState, delay: Option<Duration>) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.teardown_session().await;
        self.schedule_reconnect(next, delay);
    }

    fn schedule_reconnect(&mut self, state: ConnectionState, delay: Option<Duration>) {
        if delay.is_some_and(|delay| delay.is_zero()) {
            info!("Reconnecting immediately");
            self.set_state(state);
            self.start_connecting();
            return;
        }
        let delay = delay.unwrap_or_else(|| self.reconnect.next_delay());
        info!(
            "Attempting to connect again in {:?} (attempt {})",
            delay,
            self.reconnect.attempt()
        );
        self.set_state(state);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn go_disconnected(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        self.teardown_session().await;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn subscribe(
        &mut self,
        name: &str,
        channel_data: Option<String>,
        auth: Option<String>,
    ) -> Channel {
        let channel_data = channel_data.or_else(|| {
            (ChannelKind::from_name(name) == ChannelKind::Presence)
                .then(|| self.default_user_data.clone())
                .flatten()
        });
        let weak = self.weak_commands.clone();
        let (channel, created) = self
            .registry
            .get_or_insert_with(name, || Channel::new(name, channel_data, auth, weak));

        let connected = self.state == ConnectionState::Connected;
        if created && connected {
            self.begin_subscribe(&channel).await;
        } else if created {
            debug!("Deferring subscription to {} until connected", name);
        } else if connected && self.failed_auth.remove(name) {
            info!("Retrying authentication for {}", name);
            self.begin_subscribe(&channel).await;
        }
        channel
    }

    async fn unsubscribe(&mut self, name: &str) {
        if self.registry.remove(name).is_none() {
            return;
        }
        if let Some(pending) = self.pending_auth.remove(name) {
            pending.task.abort();
        }
        self.failed_auth.remove(name);
        if self.state == ConnectionState::Connected {
            let frame = message::unsubscribe_frame(name);
            match frame {
                Ok(frame) => {
                    if let Err(e) = self.send_frame(frame).await {
                        warn!("Failed to send unsubscribe for {}: {}", name, e);
                    }
                }
                Err(e) => error!("Failed to encode unsubscribe for {}: {}", name, e),
            }
        }
    }

    /// Send the subscribe frame, authenticating first when the channel requires it
    async fn begin_subscribe(&mut self, channel: &Channel) {
        if !channel.kind().requires_auth() {
            self.send_subscribe(channel.name(), None, None).await;
            return;
        }

        if let Some(auth) = channel.preset_auth() {
            self.send_subscribe(channel.name(), Some(auth), channel.channel_data())
                .await;
            return;
        }

        if self.pending_auth.contains_key(channel.name()) {
            debug!("Authentication already in flight for {}", channel.name());
            return;
        }

        let (Some(authenticator), Some(socket_id)) = (&self.authenticator, &self.socket_id) else {
            let err = PusherError::auth_failed(channel.name(), "no authenticator configured");
            warn!("{}", err);
            self.failed_auth.insert(channel.name().to_string());
            channel.dispatch_error(&err);
            return;
        };

        self.next_auth_id += 1;
        let id = self.next_auth_id;
        let epoch = self.epoch;
        let request = AuthRequest {
            socket_id: socket_id.clone(),
            channel: channel.name().to_string(),
            channel_data: channel.channel_data().map(str::to_string),
        };
        let authenticator = Arc::clone(authenticator);
        let outcomes = self.auth_tx.clone();

        debug!("Requesting authentication for {}", request.channel);
        let task = tokio::spawn(async move {
            let result = authenticator.authenticate(&request).await;
            let _ = outcomes.send(AuthOutcome {
                id,
                epoch,
                channel: request.channel,
                result,
            });
        });
        self.pending_auth
            .insert(channel.name().to_string(), PendingAuth { id, task });
    }

    async fn on_auth_outcome(&mut self, outcome: AuthOutcome) {
        let current = self
            .pending_auth
            .get(&outcome.channel)
            .is_some_and(|pending| pending.id == outcome.id);
        if !current || outcome.epoch != self.epoch || self.state != ConnectionState::Connected {
            debug!("Discarding stale authentication result for {}", outcome.channel);
            return;
        }
        self.pending_auth.remove(&outcome.channel);

        let Some(channel) = self.registry.get(&outcome.channel).cloned() else {
            return;
        };
        match outcome.result {
            Ok(data) => {
                self.send_subscribe(
                    channel.name(),
                    Some(&data.auth),
                    data.channel_data.as_deref(),
                )
                .await;
            }
            Err(e) => {
                let err = match e {
                    e @ PusherError::AuthenticationFailed { .. } => e,
                    other => PusherError::auth_failed(channel.name(), other.to_string()),
                };
                warn!("{}", err);
                channel.set_subscribed(false);
                self.failed_auth.insert(channel.name().to_string());
                channel.dispatch_error(&err);
            }
        }
    }

    async fn send_subscribe(&mut self, name: &str, auth: Option<&str>, channel_data: Option<&str>) {
        let result = match message::subscribe_frame(name, auth, channel_data) {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to send subscribe for {}: {}", name, e);
        }
    }

    async fn send_event(
        &mut self,
        event: &str,
        data: serde_json::Value,
        channel: Option<&str>,
    ) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(PusherError::NotConnected);
        }
        let frame = PusherMessage::new(event, channel, data).encode()?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        match &self.session {
            Some(session) => session.send_text(frame).await,
            None => Err(PusherError::NotConnected),
        }
    }
}

async fn wait_opened(
    opening: &mut Option<JoinHandle<Result<TransportSession>>>,
) -> Result<TransportSession> {
    match opening.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(PusherError::Transport(format!("open task failed: {}", e))),
        },
        None => std::future::pending().await,
    }
}

async fn next_transport_event(session: &mut Option<TransportSession>) -> Option<TransportEvent> {
    match session.as_mut() {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
