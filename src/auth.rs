use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{PusherError, Result};

/// Everything needed to authorise one private or presence subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub socket_id: String,
    pub channel: String,
    /// JSON-encoded user data, presence channels only
    pub channel_data: Option<String>,
}

/// Authentication payload embedded verbatim in the subscribe frame
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthData {
    pub auth: String,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Produces auth tokens for restricted channels. Called off the connection
/// loop; implementations may take as long as they need.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthData>;
}

/// Build the authenticator implied by the configuration: local signing when a
/// secret is present, otherwise the remote endpoint.
pub(crate) fn from_config(config: &ClientConfig) -> Option<Arc<dyn Authenticator>> {
    if let Some(secret) = &config.app_secret {
        Some(Arc::new(SecretAuthenticator::new(&config.app_key, secret)))
    } else {
        config.auth_endpoint.as_ref().map(|endpoint| {
            let mut authenticator = EndpointAuthenticator::new(endpoint);
            for (name, value) in &config.auth_headers {
                authenticator = authenticator.with_header(name, value);
            }
            for (name, value) in &config.auth_params {
                authenticator = authenticator.with_param(name, value);
            }
            Arc::new(authenticator) as Arc<dyn Authenticator>
        })
    }
}

/// Signs subscriptions locally with the application secret
#[derive(Clone)]
pub struct SecretAuthenticator {
    app_key: String,
    secret: String,
}

impl SecretAuthenticator {
    pub fn new(app_key: &str, secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Auth format: app_key:hex_encoded_hmac
    pub fn sign(&self, request: &AuthRequest) -> Result<String> {
        // Private: socket_id:channel_name, presence: socket_id:channel_name:channel_data
        let subject = match &request.channel_data {
            Some(data) => format!("{}:{}:{}", request.socket_id, request.channel, data),
            None => format!("{}:{}", request.socket_id, request.channel),
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| PusherError::auth_failed(&request.channel, "HMAC creation failed"))?;
        mac.update(subject.as_bytes());
        let result = mac.finalize().into_bytes();

        Ok(format!("{}:{}", self.app_key, hex::encode(result)))
    }
}

#[async_trait]
impl Authenticator for SecretAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthData> {
        Ok(AuthData {
            auth: self.sign(request)?,
            channel_data: request.channel_data.clone(),
        })
    }
}

/// Fetches tokens from an HTTP endpoint: POST `socket_id` and `channel_name`
/// as a form, expect `{"auth": ..., "channel_data": ...}` back.
#[derive(Clone)]
pub struct EndpointAuthenticator {
    endpoint: String,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    http_client: HttpClient,
}

impl EndpointAuthenticator {
    pub fn new(endpoint: &str) -> Self {
        let http_client = HttpClient::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            endpoint: endpoint.to_string(),
            headers: Vec::new(),
            params: Vec::new(),
            http_client,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    async fn fetch(&self, request: &AuthRequest) -> std::result::Result<AuthData, String> {
        let mut form: Vec<(&str, &str)> = vec![
            ("socket_id", request.socket_id.as_str()),
            ("channel_name", request.channel.as_str()),
        ];
        if let Some(data) = &request.channel_data {
            form.push(("channel_data", data.as_str()));
        }
        for (name, value) in &self.params {
            form.push((name.as_str(), value.as_str()));
        }

        let mut builder = self.http_client.post(&self.endpoint).form(&form);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("auth endpoint returned {}", status));
        }

        let mut data: AuthData = response
            .json()
            .await
            .map_err(|e| format!("malformed auth response: {}", e))?;
        if data.auth.is_empty() {
            return Err("auth response carried an empty token".to_string());
        }
        if data.channel_data.is_none() {
            data.channel_data = request.channel_data.clone();
        }
        Ok(data)
    }
}

#[async_trait]
impl Authenticator for EndpointAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthData> {
        debug!("Requesting auth for {} from {}", request.channel, self.endpoint);
        self.fetch(request).await.map_err(|reason| {
            warn!("Authentication for {} failed: {}", request.channel, reason);
            PusherError::auth_failed(&request.channel, reason)
        })
    }
}
