//! Configuration for the synchronization engine.

use crate::decode::PayloadDecoder;
use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Address of a synchronization server.
///
/// Always a `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Builds a `ws://host:port` endpoint.
    ///
    /// IPv6 literals may be given with or without brackets.
    pub fn from_host_port(host: &str, port: u16) -> SyncResult<Self> {
        if host.is_empty() {
            return Err(SyncError::InvalidEndpoint("empty host".into()));
        }
        if host.contains(':') && !host.starts_with('[') {
            return Self::parse(&format!("ws://[{}]:{}", host, port));
        }
        Self::parse(&format!("ws://{}:{}", host, port))
    }

    /// Parses a full `ws://` or `wss://` URL.
    pub fn parse(url: &str) -> SyncResult<Self> {
        let url = Url::parse(url).map_err(|e| SyncError::InvalidEndpoint(format!("{url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SyncError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(SyncError::InvalidEndpoint(format!("{url}: missing host")));
        }
        Ok(Self { url })
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the endpoint as a string.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Endpoint used by [`Client::reconnect`](crate::Client::reconnect) when
    /// the client has never been started explicitly.
    pub endpoint: Option<Endpoint>,
    /// Response type requested for resources that don't declare one.
    pub default_response_type: Option<String>,
    /// Decoder for resources that don't declare one.
    pub default_decoder: PayloadDecoder,
}

impl ClientConfig {
    /// Creates a configuration with no endpoint and the raw decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the default response type.
    pub fn with_default_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.default_response_type = Some(response_type.into());
        self
    }

    /// Sets the default payload decoder.
    pub fn with_default_decoder(mut self, decoder: PayloadDecoder) -> Self {
        self.default_decoder = decoder;
        self
    }
}

/// Configuration for [`HttpFetcher`](crate::HttpFetcher).
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Base URL that relative resource URLs are resolved against.
    pub base_url: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl FetchConfig {
    /// Creates a fetch configuration with default timeout and user agent.
    pub fn new() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("consistency/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::new()
    }
}
