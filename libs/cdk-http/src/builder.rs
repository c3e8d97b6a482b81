use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};

use crate::body::{RequestBody, ResponseBody};
use crate::client::Client;
use crate::config::{ClientOptions, DEFAULT_USER_AGENT, TlsRootConfig, parse_http_url};
use crate::connector::Connector;
use crate::cookies::CookieStore;
use crate::error::HttpError;
use crate::layers::{CharsetLayer, ContentCoding, ContentEncodingLayer, RateLimitLayer};

/// Type-erased request executor at any level of the chain.
pub type Transport = BoxCloneSyncService<Request<RequestBody>, Response<ResponseBody>, HttpError>;

/// Builder for [`Client`].
///
/// Setters are applied in call order over [`ClientOptions::default`]; a later
/// setter for the same option wins. Nothing is validated until [`build`](Self::build).
#[derive(Default)]
pub struct ClientBuilder {
    options: ClientOptions,
    cookie_store: Option<Arc<dyn CookieStore>>,
    base_transport: Option<Transport>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete set of options (e.g. loaded from a config file).
    #[must_use]
    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Replace every option set so far.
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.options.base_uri = Some(uri.into());
        self
    }

    /// Add a default header, replacing an earlier one with the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    /// Replace the whole default header set.
    #[must_use]
    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.options.headers = headers;
        self
    }

    #[must_use]
    pub fn proxy_uri(mut self, uri: impl Into<String>) -> Self {
        self.options.proxy_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.options.max_idle_connections = max;
        self
    }

    #[must_use]
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.options.max_connections_per_host = max;
        self
    }

    #[must_use]
    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.options.read_buffer_size = bytes;
        self
    }

    #[must_use]
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.options.write_buffer_size = bytes;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.options.keep_alive = interval;
        self
    }

    #[must_use]
    pub fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.tls_handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn expect_continue_timeout(mut self, timeout: Duration) -> Self {
        self.options.expect_continue_timeout = timeout;
        self
    }

    #[must_use]
    pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn response_header_timeout(mut self, timeout: Duration) -> Self {
        self.options.response_header_timeout = timeout;
        self
    }

    #[must_use]
    pub fn requests_per_second(mut self, rate: f64) -> Self {
        self.options.requests_per_second = rate;
        self
    }

    #[must_use]
    pub fn burst(mut self, burst: u32) -> Self {
        self.options.burst = burst;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.options.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn force_request_encoding(mut self, coding: Option<ContentCoding>) -> Self {
        self.options.force_request_encoding = coding;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.options.tls_roots = roots;
        self
    }

    /// Keep cookies in a caller-supplied, synchronized store instead of a
    /// per-client snapshot.
    #[must_use]
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Replace the network transport under the layer chain.
    ///
    /// The rate limit, content coding and charset layers still wrap it, which
    /// makes this the seam for in-process stub transports.
    #[must_use]
    pub fn base_transport<S>(mut self, service: S) -> Self
    where
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.base_transport = Some(BoxCloneSyncService::new(service));
        self
    }

    /// Validate the options and compose `Charset(ContentEncoding(RateLimit(base)))`.
    ///
    /// # Errors
    /// `InvalidConfig`, `InvalidUri`, `InvalidHeaderName` or `InvalidHeaderValue`
    /// for rejected options; `Transport` when TLS roots cannot be loaded.
    pub fn build(self) -> Result<Client, HttpError> {
        let options = self.options;
        options.validate()?;

        let headers = header_map(&options.headers)?;
        let user_agent =
            HeaderValue::from_str(options.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))?;
        let base_uri = options.base_uri.as_deref().map(parse_http_url).transpose()?;

        let base = match self.base_transport {
            Some(transport) => transport,
            None => hyper_transport(&options)?,
        };

        let chain = ServiceBuilder::new()
            .layer(CharsetLayer::new())
            .layer(ContentEncodingLayer::new().force_request_encoding(options.force_request_encoding))
            .layer(RateLimitLayer::new(options.rate_limit())?)
            .service(base);

        tracing::debug!(
            base_uri = options.base_uri.as_deref().unwrap_or(""),
            requests_per_second = options.requests_per_second,
            burst = options.burst,
            proxied = options.proxy_uri.is_some(),
            "http client built"
        );

        Ok(Client::from_parts(
            options,
            base_uri,
            headers,
            user_agent,
            BoxCloneSyncService::new(chain),
            self.cookie_store,
        ))
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())?;
        let value = HeaderValue::from_str(value.trim())?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Pooled hyper client bounded by the per-host concurrency cap and the
/// exchange timeout.
fn hyper_transport(options: &ClientOptions) -> Result<Transport, HttpError> {
    let connector = Connector::new(options)?;

    let mut client_builder = HyperClient::builder(TokioExecutor::new());
    // pool_timer drives pool_idle_timeout
    client_builder
        .pool_timer(TokioTimer::new())
        .timer(TokioTimer::new())
        .pool_max_idle_per_host(options.max_idle_connections)
        .pool_idle_timeout(options.idle_connection_timeout);
    let client: HyperClient<Connector, RequestBody> = client_builder.build(connector);

    let timeout = exchange_timeout(options);
    let service = ServiceBuilder::new()
        .concurrency_limit(options.max_connections_per_host)
        .timeout(timeout)
        .map_response(box_response)
        .service(client)
        .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

    Ok(BoxCloneSyncService::new(service))
}

/// Connection setup keeps its own bound inside the connector; waiting for the
/// response headers gets `response_header_timeout` on top of it.
fn exchange_timeout(options: &ClientOptions) -> Duration {
    options
        .connect_timeout
        .saturating_add(options.tls_handshake_timeout)
        .saturating_add(options.response_header_timeout)
}

fn box_response(response: Response<hyper::body::Incoming>) -> Response<ResponseBody> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// Map tower errors to `HttpError`, keeping typed errors raised below the timeout.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    if let Some(deadline) = connect_deadline(&*err) {
        return HttpError::Timeout(deadline);
    }
    HttpError::from_boxed(err)
}

/// Connect deadline raised by the connector, wrapped by the pool's error.
fn connect_deadline(err: &(dyn std::error::Error + 'static)) -> Option<Duration> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(HttpError::Timeout(deadline)) = cause.downcast_ref::<HttpError>() {
            return Some(*deadline);
        }
        source = cause.source();
    }
    None
}
