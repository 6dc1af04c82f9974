//! HTTP client used by the WHIP/WHEP signaling clients
//!
//! The client is stateless and never retries; retry policy lives in
//! [`crate::reconnect`]. Non-2xx responses are returned to the caller and
//! classified there, only transport failures become errors.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

/// Request headers and body
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Extra headers (case preserved, unique keys)
    pub headers: BTreeMap<String, String>,
    /// Request body
    pub body: String,
    /// `Content-Type` of the body, if any
    pub content_type: Option<String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add `Authorization: Bearer <token>` when a token is present
    pub fn with_bearer(self, token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => {
                self.with_header("Authorization", format!("Bearer {}", token))
            }
            _ => self,
        }
    }
}

/// Response status, headers and body
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP surface needed by the signaling clients
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform one request and return whatever the server answered
    async fn send(&self, method: Method, url: &str, request: HttpRequest) -> Result<HttpResponse>;

    async fn post(&self, url: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.send(Method::POST, url, request).await
    }

    async fn patch(&self, url: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.send(Method::PATCH, url, request).await
    }

    async fn delete(&self, url: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.send(Method::DELETE, url, request).await
    }
}

/// HTTP client timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Whole-request timeout (ms)
    pub request_timeout_ms: u64,
    /// TCP/TLS connect timeout (ms)
    pub connect_timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

/// [`HttpClient`] backed by reqwest
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(concat!("webrtc-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, method: Method, url: &str, request: HttpRequest) -> Result<HttpResponse> {
        debug!("HTTP {} {}", method, url);

        let mut builder = self.client.request(method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BridgeError::Network(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Network(format!("Failed to read response body: {}", e)))?;

        trace!("HTTP {} {} -> {} ({} bytes)", method, url, status, body.len());

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
