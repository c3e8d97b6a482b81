use std::time::Duration;
use thiserror::Error;

/// Maximum number of response body bytes embedded in an expectation mismatch.
pub const ERROR_BODY_EXCERPT_LIMIT: usize = 8 * 1024;

/// Boxed error used for body streams and erased sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP client error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Marshal/unmarshal requested for a MIME type outside the codec registry
    #[error("Unsupported content type: '{content_type}'")]
    UnsupportedContentType { content_type: String },

    /// Response declares a charset with no known decoder
    #[error("Unsupported charset: '{charset}'")]
    UnsupportedCharset { charset: String },

    /// `Content-Type` header could not be parsed as a media type
    #[error("Invalid content type '{value}': {reason}")]
    InvalidContentType { value: String, reason: String },

    /// Context was canceled while waiting for a rate-limit token
    #[error("Rate limit wait canceled")]
    RateLimitCanceled,

    /// Context was canceled (or its deadline passed) during the call
    #[error("Request canceled")]
    Canceled,

    /// Transport error (network, connection, TLS, proxy)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// Response headers did not arrive in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed compressed stream
    #[error("Failed to decode {encoding} stream: {source}")]
    Decode {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Response did not match the endpoint expectation
    #[error("{reason}: expected {expected}, got {actual}. The response contains - {body_excerpt}")]
    ExpectationMismatch {
        reason: String,
        expected: String,
        actual: String,
        body_excerpt: String,
    },

    /// Local I/O failure (file create/write, request body read)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded for the given content type
    #[error("Failed to marshal {content_type}: {source}")]
    Marshal {
        content_type: &'static str,
        #[source]
        source: BoxError,
    },

    /// Body could not be decoded for the given content type
    #[error("Failed to unmarshal {content_type}: {source}")]
    Unmarshal {
        content_type: &'static str,
        #[source]
        source: BoxError,
    },

    /// Client options rejected at construction time
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// URL could not be used as a request target
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// Method outside GET/HEAD/POST/PUT/DELETE/CONNECT/OPTIONS/TRACE/PATCH
    #[error("Invalid HTTP method: '{0}'")]
    InvalidMethod(String),

    /// Endpoint descriptor failed validation
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),
}

impl HttpError {
    /// Recover a typed error from a boxed body or service error.
    ///
    /// Body streams carry [`BoxError`]; decoding layers box `HttpError` values into
    /// them, so they are unwrapped here instead of being reported as transport noise.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<HttpError>() {
            Ok(http_err) => *http_err,
            Err(other) => match other.downcast::<std::io::Error>() {
                Ok(io) => HttpError::Io(*io),
                Err(other) => HttpError::Transport(other),
            },
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
