use thiserror::Error;

/// Error types for the pusher-rs library
#[derive(Error, Debug)]
pub enum PusherError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Channel authentication failed for {channel}: {reason}")]
    AuthenticationFailed { channel: String, reason: String },
    #[error("Subscription to {channel} rejected: {message}")]
    SubscriptionError { channel: String, message: String },
    #[error("Not connected")]
    NotConnected,
    #[error("No pong received within the heartbeat timeout")]
    HeartbeatTimeout,
    #[error("Client event rejected: {0}")]
    ClientEventRejected(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Client event loop has stopped")]
    ClientClosed,
}

impl PusherError {
    pub(crate) fn auth_failed(channel: &str, reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PusherError>;
