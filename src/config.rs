use std::env;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::error::{PusherError, Result};

pub const DEFAULT_HOST: &str = "ws.pusherapp.com";
pub const CLIENT_NAME: &str = "pusher-rs";
pub const PROTOCOL_VERSION: u8 = 7;

/// HTTP proxy used to tunnel the WebSocket connection (HTTP CONNECT)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl ProxyConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Value for the `Proxy-Authorization` header, if credentials are set
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|(user, pass)| {
            format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
        })
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identifies the application to the server
    pub app_key: String,
    /// Selects the `ws-{cluster}.pusher.com` host
    pub cluster: Option<String>,
    /// Custom host, used when no cluster is set
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secure: bool,
    /// Enables local signing of private and presence subscriptions
    pub app_secret: Option<String>,
    /// Remote authentication endpoint
    pub auth_endpoint: Option<String>,
    pub auth_headers: Vec<(String, String)>,
    pub auth_params: Vec<(String, String)>,
    /// Default user data for presence channels
    pub user_data: Option<serde_json::Value>,
    pub proxy: Option<ProxyConfig>,
    /// Idle time before the client pings the server
    pub activity_timeout: Duration,
    /// Time allowed for any reply after a ping
    pub pong_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(app_key: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            cluster: None,
            host: None,
            port: None,
            secure: true,
            app_secret: None,
            auth_endpoint: None,
            auth_headers: Vec::new(),
            auth_params: Vec::new(),
            user_data: None,
            proxy: None,
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set application secret for local authentication
    pub fn with_app_secret(mut self, secret: &str) -> Self {
        self.app_secret = Some(secret.to_string());
        self
    }

    /// Set authentication endpoint
    pub fn with_auth_endpoint(mut self, endpoint: &str) -> Self {
        self.auth_endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_auth_header(mut self, name: &str, value: &str) -> Self {
        self.auth_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_auth_param(mut self, name: &str, value: &str) -> Self {
        self.auth_params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_key.trim().is_empty() {
            return Err(PusherError::Config("app key must not be empty".to_string()));
        }
        if self.activity_timeout.is_zero() || self.pong_timeout.is_zero() {
            return Err(PusherError::Config(
                "heartbeat timeouts must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.auth_endpoint {
            Url::parse(endpoint)?;
        }
        Ok(())
    }

    pub fn host(&self) -> String {
        match (&self.cluster, &self.host) {
            (Some(cluster), _) => format!("ws-{}.pusher.com", cluster),
            (None, Some(host)) => host.clone(),
            (None, None) => DEFAULT_HOST.to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }

    /// WebSocket URL for this application
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let url = format!(
            "{}://{}:{}/app/{}?client={}&version={}&protocol={}",
            scheme,
            self.host(),
            self.port(),
            urlencoding::encode(&self.app_key),
            CLIENT_NAME,
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        );
        Ok(Url::parse(&url)?)
    }

    /// Load configuration from `PUSHER_*` environment variables
    pub fn from_env() -> Result<Self> {
        let app_key = env::var("PUSHER_APP_KEY")
            .map_err(|_| PusherError::Config("missing PUSHER_APP_KEY".to_string()))?;

        let mut config = Self::new(&app_key);
        config.cluster = env::var("PUSHER_CLUSTER").ok();
        config.host = env::var("PUSHER_HOST").ok();
        config.port = parse_env_opt("PUSHER_PORT")?;
        config.secure = parse_env_opt("PUSHER_SECURE")?.unwrap_or(true);
        config.app_secret = env::var("PUSHER_APP_SECRET").ok();
        config.auth_endpoint = env::var("PUSHER_AUTH_ENDPOINT").ok();

        if let Ok(host) = env::var("PUSHER_PROXY_HOST") {
            let port = parse_env_opt("PUSHER_PROXY_PORT")?.unwrap_or(8080);
            let mut proxy = ProxyConfig::new(&host, port);
            if let Ok(user) = env::var("PUSHER_PROXY_USER") {
                let password = env::var("PUSHER_PROXY_PASSWORD").unwrap_or_default();
                proxy = proxy.with_credentials(&user, &password);
            }
            config.proxy = Some(proxy);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env_opt<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| PusherError::Config(format!("invalid value for {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}
