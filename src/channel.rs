use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::connection::Command;
use crate::error::{PusherError, Result};
use crate::event::{self, Bindings, CallbackHandle, Event};
use crate::message::client_event_name;

/// Channel kinds, derived from the channel name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("presence-") {
            ChannelKind::Presence
        } else if name.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Check if the channel requires authentication
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ChannelKind::Public)
    }
}

/// A subscribed (or pending) channel. Cloning is cheap and every clone
/// refers to the same registry entry.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    kind: ChannelKind,
    subscribed: AtomicBool,
    bindings: Mutex<Bindings>,
    channel_data: Option<String>,
    auth: Option<String>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(
        name: &str,
        channel_data: Option<String>,
        auth: Option<String>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                kind: ChannelKind::from_name(name),
                subscribed: AtomicBool::new(false),
                bindings: Mutex::new(Bindings::default()),
                channel_data,
                auth,
                commands,
            }),
        }
    }

    /// Get the channel name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    /// True once the server acknowledged the subscription on the current socket
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    /// User data sent along with a presence subscription
    pub fn channel_data(&self) -> Option<&str> {
        self.inner.channel_data.as_deref()
    }

    /// Auth token supplied by the application instead of an authenticator
    pub(crate) fn preset_auth(&self) -> Option<&str> {
        self.inner.auth.as_deref()
    }

    /// Register a callback for an event on this channel.
    ///
    /// Callbacks run on the connection's event loop, in registration order;
    /// a slow callback delays every event behind it.
    pub fn bind<F>(&self, event_name: &str, callback: F) -> CallbackHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        event::lock(&self.inner.bindings).bind(event_name, Arc::new(callback))
    }

    /// Register a callback for subscription failures (authentication or server rejection)
    pub fn bind_error<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&PusherError) + Send + Sync + 'static,
    {
        event::lock(&self.inner.bindings).bind_error(Arc::new(callback))
    }

    /// Remove one registration. Returns false if the handle is unknown to this channel.
    pub fn unbind(&self, handle: CallbackHandle) -> bool {
        event::lock(&self.inner.bindings).unbind(handle)
    }

    /// Trigger a client event on this channel. Only private and presence
    /// channels accept client events, and only once subscribed.
    pub async fn trigger(&self, event: &str, data: serde_json::Value) -> Result<()> {
        if !self.kind().requires_auth() {
            return Err(PusherError::ClientEventRejected(format!(
                "{} is not a private or presence channel",
                self.name()
            )));
        }
        if !self.is_subscribed() {
            return Err(PusherError::NotConnected);
        }

        let commands = self
            .inner
            .commands
            .upgrade()
            .ok_or(PusherError::ClientClosed)?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Send {
                event: client_event_name(event),
                data,
                channel: Some(self.name().to_string()),
                reply,
            })
            .map_err(|_| PusherError::ClientClosed)?;
        rx.await.map_err(|_| PusherError::ClientClosed)?
    }

    pub(crate) fn set_subscribed(&self, subscribed: bool) {
        self.inner.subscribed.store(subscribed, Ordering::SeqCst);
    }

    pub(crate) fn dispatch(&self, event: &Event) -> usize {
        event::dispatch(&self.inner.bindings, event)
    }

    pub(crate) fn dispatch_error(&self, err: &PusherError) -> usize {
        event::dispatch_error(&self.inner.bindings, err)
    }

    /// Whether both handles refer to the same channel object
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.same_channel(other)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
