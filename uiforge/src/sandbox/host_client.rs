//! Outbound calls to the host application.
//!
//! The broker is the only caller. Credentials live here, on the trusted
//! side, and are attached to every request.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE};
use serde_json::Value;
use url::Url;

use crate::config::HostSettings;
use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq)]
pub struct HostRequest {
    pub method: String,
    /// Path plus encoded query string, relative to the host's base URL
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostResponse {
    pub status: u16,
    /// Decoded JSON body; non-JSON bodies become a string, empty bodies null
    pub body: Value,
}

impl HostResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One host-call attempt. `Err` carries a transport failure message.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn send(&self, request: HostRequest) -> Result<HostResponse, String>;
}

pub struct HttpHostClient {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    cookie: Option<String>,
}

impl std::fmt::Debug for HttpHostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHostClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.auth_token.is_some())
            .field("has_cookie", &self.cookie.is_some())
            .finish()
    }
}

impl HttpHostClient {
    pub fn new(settings: &HostSettings) -> ForgeResult<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .ok_or_else(|| ForgeError::Config("Host base_url is not configured".to_string()))?;
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ForgeError::Config(format!("Invalid host base_url '{}': {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let prefixed = format!("{}/", base_url.path());
            base_url.set_path(&prefixed);
        }

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ForgeError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            auth_token: settings.auth_token.clone(),
            cookie: settings.cookie.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a host path under the base URL, keeping its path prefix.
    pub fn resolve(&self, path: &str) -> Result<Url, String> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| format!("Invalid host path {}: {}", path, e))?;
        if !url.as_str().starts_with(self.base_url.as_str()) {
            return Err(format!("Host path {} resolves outside {}", path, self.base_url));
        }
        Ok(url)
    }
}

#[async_trait]
impl HostClient for HttpHostClient {
    async fn send(&self, request: HostRequest) -> Result<HostResponse, String> {
        let url = self.resolve(&request.path)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("Invalid HTTP method {}: {}", request.method, e))?;

        let mut builder = self
            .client
            .request(method, url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(cookie) = &self.cookie {
            builder = builder.header(COOKIE, cookie);
        }
        if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body).map_err(|e| e.to_string())?;
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(bytes);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        log::debug!("{} {} -> {}", request.method, request.path, status);
        Ok(HostResponse { status, body })
    }
}
