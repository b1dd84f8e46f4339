//! Client for the Pusher channels protocol.
//!
//! ```no_run
//! use pusher_rs::{ClientConfig, PusherClient};
//!
//! # async fn run() -> pusher_rs::Result<()> {
//! let client = PusherClient::new(ClientConfig::new("app-key").with_cluster("eu"))?;
//! let channel = client.subscribe("public-room").await?;
//! channel.bind("myevent", |event| println!("{}", event.data));
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
mod registry;
pub mod transport;

pub use auth::{AuthData, AuthRequest, Authenticator, EndpointAuthenticator, SecretAuthenticator};
pub use backoff::ReconnectPolicy;
pub use channel::{Channel, ChannelKind};
pub use client::PusherClient;
pub use config::{ClientConfig, ProxyConfig};
pub use connection::ConnectionState;
pub use error::{PusherError, Result};
pub use event::{CallbackHandle, Event};
pub use transport::{
    OutboundFrame, Transport, TransportEvent, TransportSession, WebSocketTransport,
};
