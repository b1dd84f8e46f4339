use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PusherError, Result};

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";

/// Pusher protocol message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PusherMessage {
    pub fn new(event: &str, channel: Option<&str>, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            channel: channel.map(str::to_string),
            data,
        }
    }

    /// Parse a text frame received from the transport
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PusherError::Protocol(format!("malformed frame: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The payload as handed to callbacks: strings verbatim, anything else as JSON text
    pub fn data_as_string(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    /// Decode the payload, accepting both JSON-encoded strings and inline objects
    fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let parsed = match &self.data {
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| PusherError::Protocol(format!("invalid {} payload: {}", self.event, e)))
    }
}

/// Connection data received after establishing connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Error data structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: String,
}

/// What the server asks the client to do after a `pusher:error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// 4000-4099: the connection must not be re-established unchanged
    Disconnect,
    /// 4100-4199: reconnect after backing off
    ReconnectLater,
    /// 4200-4299: reconnect immediately
    ReconnectNow,
    /// Anything else is informational
    Report,
}

impl ErrorData {
    pub fn action(&self) -> ErrorAction {
        match self.code {
            Some(4000..=4099) => ErrorAction::Disconnect,
            Some(4100..=4199) => ErrorAction::ReconnectLater,
            Some(4200..=4299) => ErrorAction::ReconnectNow,
            _ => ErrorAction::Report,
        }
    }
}

/// A decoded inbound frame, split into the notifications the connection cares about
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ConnectionEstablished(ConnectionData),
    Ping,
    Pong,
    Error(ErrorData, PusherMessage),
    SubscriptionSucceeded(String, PusherMessage),
    SubscriptionError(String, PusherMessage),
    /// Any frame addressed to a channel
    ChannelEvent(String, PusherMessage),
    /// Any other frame without a channel
    ConnectionEvent(PusherMessage),
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self> {
        Self::classify(PusherMessage::decode(text)?)
    }

    pub fn classify(message: PusherMessage) -> Result<Self> {
        match (message.event.as_str(), message.channel.clone()) {
            (CONNECTION_ESTABLISHED, _) => {
                Ok(Inbound::ConnectionEstablished(message.data_as::<ConnectionData>()?))
            }
            (PING, None) => Ok(Inbound::Ping),
            (PONG, None) => Ok(Inbound::Pong),
            (ERROR, None) => {
                let data = message.data_as::<ErrorData>().unwrap_or_else(|_| ErrorData {
                    code: None,
                    message: message.data_as_string(),
                });
                Ok(Inbound::Error(data, message))
            }
            (SUBSCRIPTION_SUCCEEDED, Some(channel)) => {
                Ok(Inbound::SubscriptionSucceeded(channel, message))
            }
            (SUBSCRIPTION_SUCCEEDED, None) => Err(PusherError::Protocol(
                "subscription_succeeded without a channel".to_string(),
            )),
            (SUBSCRIPTION_ERROR, Some(channel)) => Ok(Inbound::SubscriptionError(channel, message)),
            (_, Some(channel)) => Ok(Inbound::ChannelEvent(channel, message)),
            (_, None) => Ok(Inbound::ConnectionEvent(message)),
        }
    }
}

/// Subscribe data structure
#[derive(Debug, Clone, Serialize)]
struct SubscribeData<'a> {
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_data: Option<&'a str>,
}

/// Subscribe message structure
#[derive(Debug, Clone, Serialize)]
struct SubscribeMessage<'a> {
    event: &'a str,
    data: SubscribeData<'a>,
}

pub fn subscribe_frame(
    channel: &str,
    auth: Option<&str>,
    channel_data: Option<&str>,
) -> Result<String> {
    let message = SubscribeMessage {
        event: SUBSCRIBE,
        data: SubscribeData {
            channel,
            auth,
            channel_data,
        },
    };
    Ok(serde_json::to_string(&message)?)
}

pub fn unsubscribe_frame(channel: &str) -> Result<String> {
    PusherMessage::new(
        UNSUBSCRIBE,
        None,
        serde_json::json!({ "channel": channel }),
    )
    .encode()
}

pub fn ping_frame() -> String {
    serde_json::json!({ "event": PING, "data": {} }).to_string()
}

pub fn pong_frame() -> String {
    serde_json::json!({ "event": PONG, "data": {} }).to_string()
}

/// Client event name as required by the server: always `client-` prefixed
pub fn client_event_name(event: &str) -> String {
    if !event.starts_with("client-") {
        format!("client-{}", event)
    } else {
        event.to_string()
    }
}
