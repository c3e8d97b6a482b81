use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HttpError;
use crate::layers::ContentCoding;

pub mod humantime_serde;

/// Default User-Agent: `<app-name>/<http-major>.<http-minor>`
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/1.1");

/// TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// TCP keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Extra time granted to the TLS handshake on top of the TCP connect
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long an idle pooled connection is kept
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Time allowed between sending the request and receiving response headers
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 10;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Source of trusted root certificates for TLS connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsRootConfig {
    /// Mozilla roots compiled into the binary
    #[default]
    WebPki,
    /// Roots from the operating system certificate store
    Native,
}

/// Token bucket parameters: refill at `requests_per_second`, hold at most `burst` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
        }
    }
}

impl RateLimitConfig {
    /// # Errors
    /// Returns `InvalidConfig` for a non-finite or non-positive rate, or a zero burst.
    pub fn validate(&self) -> Result<(), HttpError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(HttpError::InvalidConfig(format!(
                "requests_per_second must be a positive number, got {}",
                self.requests_per_second
            )));
        }
        if self.burst == 0 {
            return Err(HttpError::InvalidConfig("burst must be at least 1".to_owned()));
        }
        Ok(())
    }
}

/// Client configuration.
///
/// Every field has a default, so a partial YAML/JSON document (or an empty one)
/// deserializes into a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    /// Absolute `http`/`https` URI that endpoint paths are resolved against
    pub base_uri: Option<String>,

    /// Headers sent with every request unless an endpoint overrides them
    pub headers: BTreeMap<String, String>,

    /// Forward proxy for plain `http` targets
    pub proxy_uri: Option<String>,

    /// Idle pooled connections kept per host
    pub max_idle_connections: usize,

    /// Requests allowed in flight at once; further requests wait for a slot
    pub max_connections_per_host: usize,

    /// Socket receive buffer size in bytes
    pub read_buffer_size: usize,

    /// Socket send buffer size in bytes
    pub write_buffer_size: usize,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    #[serde(with = "humantime_serde")]
    pub tls_handshake_timeout: Duration,

    /// Accepted for configuration compatibility; requests are never sent with
    /// `Expect: 100-continue`, so it does not bound anything.
    #[serde(with = "humantime_serde")]
    pub expect_continue_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub idle_connection_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,

    pub requests_per_second: f64,

    pub burst: u32,

    /// Overrides [`DEFAULT_USER_AGENT`] when the request has none
    pub user_agent: Option<String>,

    /// Compress every non-empty request body with this coding
    pub force_request_encoding: Option<ContentCoding>,

    pub tls_roots: TlsRootConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_uri: None,
            headers: BTreeMap::new(),
            proxy_uri: None,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            expect_continue_timeout: DEFAULT_EXPECT_CONTINUE_TIMEOUT,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            response_header_timeout: DEFAULT_RESPONSE_HEADER_TIMEOUT,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            user_agent: None,
            force_request_encoding: None,
            tls_roots: TlsRootConfig::default(),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: self.requests_per_second,
            burst: self.burst,
        }
    }

    /// Check the options that cannot be expressed by the field types alone.
    ///
    /// # Errors
    /// `InvalidUri` for a malformed base or proxy URI, `InvalidConfig` otherwise.
    pub fn validate(&self) -> Result<(), HttpError> {
        if let Some(base) = &self.base_uri {
            parse_http_url(base)?;
        }
        if let Some(proxy) = &self.proxy_uri {
            parse_http_url(proxy)?;
        }
        if self.max_connections_per_host == 0 {
            return Err(HttpError::InvalidConfig(
                "max_connections_per_host must be at least 1".to_owned(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(HttpError::InvalidConfig(
                "connect_timeout must be non-zero".to_owned(),
            ));
        }
        if self.response_header_timeout.is_zero() {
            return Err(HttpError::InvalidConfig(
                "response_header_timeout must be non-zero".to_owned(),
            ));
        }
        self.rate_limit().validate()
    }
}

/// Parse an absolute `http`/`https` URL with a host.
pub(crate) fn parse_http_url(raw: &str) -> Result<url::Url, HttpError> {
    let invalid = |reason: String| HttpError::InvalidUri {
        url: raw.to_owned(),
        reason,
    };

    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(parsed)
}
