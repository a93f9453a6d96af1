//! Connection Factory
//!
//! Builds the HTTP transport a client sends its requests through. The
//! transport sits behind the [`HttpTransport`] trait so the transaction engine
//! can be driven by a scripted fake in tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::{AlpacaError, JSON_MIME_TYPE};

/// Which compressed response encodings the client accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    None,
    Gzip,
    Deflate,
    #[default]
    GzipAndDeflate,
}

impl Compression {
    fn gzip(&self) -> bool {
        matches!(self, Compression::Gzip | Compression::GzipAndDeflate)
    }

    fn deflate(&self) -> bool {
        matches!(self, Compression::Deflate | Compression::GzipAndDeflate)
    }
}

/// Settings a transport is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Basic authentication user. Empty means no authentication.
    pub username: String,
    pub password: String,
    /// Trust any server certificate (self-signed devices on a LAN)
    pub accept_invalid_certificates: bool,
    pub compression: Compression,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
    /// How long an idle pooled connection is kept
    pub pool_idle_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            accept_invalid_certificates: false,
            compression: Compression::default(),
            connect_timeout_ms: 10000,
            pool_idle_timeout_ms: 30000,
            user_agent: default_user_agent(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// `nightshade-alpaca/{crate version}`
pub fn default_user_agent() -> String {
    format!("nightshade-alpaca/{}", env!("CARGO_PKG_VERSION"))
}

/// HTTP verb of an Alpaca call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVerb {
    Get,
    Put,
}

impl HttpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Put => "PUT",
        }
    }
}

/// One request as the transport sees it
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub verb: HttpVerb,
    pub url: String,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
    /// Form-encoded body parameters, in order
    pub form: Vec<(String, String)>,
    /// Extra headers for this request only
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Parameters carried by the request, whichever part of it they travel in
    pub fn params(&self) -> &[(String, String)] {
        match self.verb {
            HttpVerb::Get => &self.query,
            HttpVerb::Put => &self.form,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully read response
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Body as text, for error reporting
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failures below the HTTP status level
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Refused, reset or otherwise unable to reach the server
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// Sends one HTTP request and reads the whole response
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by a pooled `reqwest` client
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client for the given settings
    pub fn new(config: &ConnectionConfig) -> Result<Self, AlpacaError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MIME_TYPE));

        if config.has_credentials() {
            let token = BASE64.encode(format!("{}:{}", config.username, config.password));
            let mut value = HeaderValue::from_str(&format!("Basic {}", token))
                .map_err(|e| AlpacaError::Configuration(format!("invalid credentials: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.as_str())
            .danger_accept_invalid_certs(config.accept_invalid_certificates)
            .gzip(config.compression.gzip())
            .deflate(config.compression.deflate())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(config.pool_idle_timeout_ms))
            .build()
            .map_err(|e| AlpacaError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        debug!(
            "Created HTTP transport (auth: {}, compression: {:?}, accept invalid certs: {})",
            config.has_credentials(),
            config.compression,
            config.accept_invalid_certificates
        );

        Ok(Self { client })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() || err.is_body() || lost_connection(&err) {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// A reset, abort or early EOF anywhere in the cause chain
fn lost_connection(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.verb {
            HttpVerb::Get => self.client.get(&request.url).query(&request.query),
            HttpVerb::Put => self.client.put(&request.url).form(&request.form),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

/// Build the transport for a connection configuration
pub fn create_transport(config: &ConnectionConfig) -> Result<Arc<dyn HttpTransport>, AlpacaError> {
    Ok(Arc::new(ReqwestTransport::new(config)?))
}
