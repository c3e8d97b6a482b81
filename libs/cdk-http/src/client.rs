use std::fmt;
use std::sync::Arc;

use http::header::{ACCEPT, COOKIE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use tower::ServiceExt;
use url::Url;

use crate::body::{self, RequestBody};
use crate::builder::{ClientBuilder, Transport};
use crate::codec::ContentType;
use crate::config::{ClientOptions, parse_http_url};
use crate::context::RequestContext;
use crate::cookies::{CookieJar, CookieStore, StoredCookie};
use crate::endpoint::Endpoint;
use crate::error::{ERROR_BODY_EXCERPT_LIMIT, HttpError};
use crate::response::{self, Response};

/// Browser-like headers added to every request that does not set them.
const DEFAULT_HEADERS: [(&str, &str); 11] = [
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml,image/avif,image/webp,*/*;q=0.8",
    ),
    ("accept-language", "en-US,en;q=0.5"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
    ("dnt", "1"),
    ("pragma", "no-cache"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
    ("upgrade-insecure-requests", "1"),
];

struct Shared {
    options: ClientOptions,
    base_uri: Option<Url>,
    headers: HeaderMap,
    user_agent: HeaderValue,
    transport: Transport,
}

/// Executes [`Endpoint`] calls against one upstream through
/// `Charset(ContentEncoding(RateLimit(base)))`.
///
/// Clones share the transport chain, and with it the rate-limit budget. Each
/// clone owns its cookie snapshot unless the client was built with a
/// [`CookieStore`]; `execute` takes `&mut self` because it replaces that
/// snapshot.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    cookies: CookieJar,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_uri", &self.shared.base_uri.as_ref().map(Url::as_str))
            .field("cookies", &self.cookies)
            .finish_non_exhaustive()
    }
}

impl Client {
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// # Errors
    /// See [`ClientBuilder::build`].
    pub fn new(options: ClientOptions) -> Result<Self, HttpError> {
        ClientBuilder::with_options(options).build()
    }

    pub(crate) fn from_parts(
        options: ClientOptions,
        base_uri: Option<Url>,
        headers: HeaderMap,
        user_agent: HeaderValue,
        transport: Transport,
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> Self {
        let cookies = cookie_store.map_or_else(CookieJar::default, CookieJar::Shared);
        Self {
            shared: Arc::new(Shared {
                options,
                base_uri,
                headers,
                user_agent,
                transport,
            }),
            cookies,
        }
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    /// Cookies that the next request will replay.
    #[must_use]
    pub fn cookies(&self) -> Vec<StoredCookie> {
        self.cookies.snapshot()
    }

    /// Perform one endpoint call.
    ///
    /// The whole call, rate-limit wait included, is bounded by `ctx`. Cookies of
    /// every response are stored before its expectation is checked, so a
    /// rejected response still updates them.
    ///
    /// # Errors
    /// - `UnsupportedContentType`/`Marshal` when the payload cannot be encoded
    /// - `InvalidUri` when the target URL cannot be resolved
    /// - `RateLimitCanceled`/`Canceled` when `ctx` ends first
    /// - `Transport`, `Timeout`, `Decode`, `UnsupportedCharset` from the chain
    /// - `ExpectationMismatch` when status or headers differ from the expectation
    pub async fn execute(
        &mut self,
        ctx: &RequestContext,
        endpoint: &Endpoint,
    ) -> Result<Response, HttpError> {
        let request = self.build_request(ctx, endpoint)?;
        let method = request.method().clone();
        let uri = request.uri().clone();
        tracing::debug!(endpoint = %endpoint.name(), %method, %uri, "sending request");

        let call = self.shared.transport.clone().oneshot(request);
        let response = tokio::select! {
            biased;
            result = call => result,
            () = ctx.done() => Err(HttpError::Canceled),
        }
        .inspect_err(|e| {
            tracing::debug!(endpoint = %endpoint.name(), %method, %uri, error = %e, "request failed");
        })?;

        self.cookies.replace(StoredCookie::from_headers(response.headers()));

        let status = response.status();
        tracing::debug!(endpoint = %endpoint.name(), %method, %uri, status = status.as_u16(), "response received");

        if let Err(failure) = endpoint.expectation().check(status, response.headers()) {
            let read = response::excerpt(response.into_body(), ERROR_BODY_EXCERPT_LIMIT);
            let body_excerpt = tokio::select! {
                biased;
                text = read => text,
                () = ctx.done() => String::new(),
            };
            return Err(HttpError::ExpectationMismatch {
                reason: failure.reason,
                expected: failure.expected,
                actual: failure.actual,
                body_excerpt,
            });
        }

        Ok(Response::new(response))
    }

    fn build_request(
        &self,
        ctx: &RequestContext,
        endpoint: &Endpoint,
    ) -> Result<Request<RequestBody>, HttpError> {
        endpoint.validate()?;
        let url = resolve_url(self.shared.base_uri.as_ref(), endpoint.path())?;
        let uri: Uri = url.as_str().parse().map_err(|e: http::uri::InvalidUri| {
            HttpError::InvalidUri {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut headers = self.shared.headers.clone();
        for name in endpoint.headers().keys() {
            headers.remove(name);
        }
        for (name, value) in endpoint.headers() {
            headers.append(name.clone(), value.clone());
        }

        let body = match endpoint.payload_value() {
            Some(payload) => body::full(ContentType::from_headers(&headers)?.marshal(payload)?),
            None => body::empty(),
        };

        self.apply_cookies(&mut headers)?;
        apply_default_headers(&mut headers);
        let accept = accept_union(headers.get(ACCEPT))?;
        headers.insert(ACCEPT, accept);
        if is_unset(headers.get(USER_AGENT)) {
            headers.insert(USER_AGENT, self.shared.user_agent.clone());
        }

        let mut request = Request::builder()
            .method(http::Method::from(endpoint.method()))
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = headers;
        request.extensions_mut().insert(ctx.clone());
        Ok(request)
    }

    fn apply_cookies(&self, headers: &mut HeaderMap) -> Result<(), HttpError> {
        let Some(stored) = StoredCookie::header_value(&self.cookies.snapshot()) else {
            return Ok(());
        };
        let value = match headers.get(COOKIE).filter(|v| !v.is_empty()) {
            Some(existing) => {
                let mut merged = existing.as_bytes().to_vec();
                merged.extend_from_slice(b"; ");
                merged.extend_from_slice(stored.as_bytes());
                HeaderValue::from_bytes(&merged)?
            }
            None => stored,
        };
        headers.insert(COOKIE, value);
        Ok(())
    }
}

fn is_unset(value: Option<&HeaderValue>) -> bool {
    value.is_none_or(HeaderValue::is_empty)
}

fn apply_default_headers(headers: &mut HeaderMap) {
    for (name, value) in DEFAULT_HEADERS {
        let name = HeaderName::from_static(name);
        if is_unset(headers.get(&name)) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

/// `current` split on commas, followed by every codec MIME type, keeping the
/// first occurrence of each entry.
fn accept_union(current: Option<&HeaderValue>) -> Result<HeaderValue, HttpError> {
    let current = current.and_then(|v| v.to_str().ok()).unwrap_or_default();
    let mut entries: Vec<&str> = Vec::new();
    let candidates = current
        .split(',')
        .map(str::trim)
        .chain(ContentType::ALL.iter().map(|ct| ct.mime()));
    for entry in candidates {
        if !entry.is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    Ok(HeaderValue::from_str(&entries.join(","))?)
}

/// Absolute `http(s)` paths are used as is; anything else is appended to the base URI.
fn resolve_url(base: Option<&Url>, path: &str) -> Result<Url, HttpError> {
    let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return parse_http_url(path);
    }
    let Some(base) = base else {
        return Err(HttpError::InvalidUri {
            url: path.to_owned(),
            reason: "relative path without a base URI".to_owned(),
        });
    };
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    parse_http_url(&joined)
}
