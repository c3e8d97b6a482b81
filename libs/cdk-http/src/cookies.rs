use std::fmt;
use std::sync::Arc;

use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;

/// A cookie captured from a `Set-Cookie` header: only name and value are replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

impl StoredCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse the `name=value` pair leading a `Set-Cookie` value. Attributes are dropped.
    #[must_use]
    pub fn parse(set_cookie: &str) -> Option<Self> {
        let pair = set_cookie.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim().trim_matches('"');
        Some(Self::new(name, value))
    }

    /// Every well-formed cookie set by a response, in header order.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Vec<Self> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Self::parse)
            .collect()
    }

    /// Render a `Cookie` request header; `None` when there is nothing to send.
    #[must_use]
    pub fn header_value(cookies: &[Self]) -> Option<HeaderValue> {
        if cookies.is_empty() {
            return None;
        }
        let joined = cookies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

impl fmt::Display for StoredCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Where a client keeps the cookies of its last response.
pub trait CookieStore: Send + Sync + fmt::Debug {
    /// Cookies to replay on the next request.
    fn load(&self) -> Vec<StoredCookie>;

    /// Replace the stored snapshot with the cookies of the latest response.
    fn store(&self, cookies: Vec<StoredCookie>);
}

/// Synchronized snapshot that several clients (or clones) can share.
#[derive(Debug, Clone, Default)]
pub struct SharedCookieStore {
    inner: Arc<Mutex<Vec<StoredCookie>>>,
}

impl SharedCookieStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieStore for SharedCookieStore {
    fn load(&self) -> Vec<StoredCookie> {
        self.inner.lock().clone()
    }

    fn store(&self, cookies: Vec<StoredCookie>) {
        *self.inner.lock() = cookies;
    }
}

/// Cookie state held by a client value.
#[derive(Debug, Clone)]
pub(crate) enum CookieJar {
    /// Unsynchronized snapshot owned by one client value.
    Owned(Vec<StoredCookie>),
    Shared(Arc<dyn CookieStore>),
}

impl Default for CookieJar {
    fn default() -> Self {
        CookieJar::Owned(Vec::new())
    }
}

impl CookieJar {
    pub(crate) fn snapshot(&self) -> Vec<StoredCookie> {
        match self {
            CookieJar::Owned(cookies) => cookies.clone(),
            CookieJar::Shared(store) => store.load(),
        }
    }

    pub(crate) fn replace(&mut self, cookies: Vec<StoredCookie>) {
        match self {
            CookieJar::Owned(current) => *current = cookies,
            CookieJar::Shared(store) => store.store(cookies),
        }
    }
}
