use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

use crate::error::HttpError;

const MAX_NAME_LEN: usize = 63;

/// Request methods an endpoint may use (RFC 9110 section 9 plus PATCH).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Connect,
        Method::Options,
        Method::Trace,
        Method::Patch,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| HttpError::InvalidMethod(s.to_owned()))
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Head => http::Method::HEAD,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Delete => http::Method::DELETE,
            Method::Connect => http::Method::CONNECT,
            Method::Options => http::Method::OPTIONS,
            Method::Trace => http::Method::TRACE,
            Method::Patch => http::Method::PATCH,
        }
    }
}

impl TryFrom<&http::Method> for Method {
    type Error = HttpError;

    fn try_from(method: &http::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

/// Why a response failed its [`Expectation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectationFailure {
    pub reason: String,
    pub expected: String,
    pub actual: String,
}

/// Acceptable outcome of an endpoint call.
///
/// Defaults to status 200 and no header requirements. A status of `None` accepts
/// any status. Every expected header must be present; names compare
/// case-insensitively and values exactly after trimming.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            status: Some(StatusCode::OK),
            headers: HeaderMap::new(),
        }
    }
}

impl Expectation {
    /// Check status and headers. Never touches the body.
    ///
    /// # Errors
    /// Returns the first mismatch found, status before headers.
    pub fn check(&self, status: StatusCode, headers: &HeaderMap) -> Result<(), ExpectationFailure> {
        if let Some(expected) = self.status
            && expected != status
        {
            return Err(ExpectationFailure {
                reason: "unexpected status".to_owned(),
                expected: expected.as_u16().to_string(),
                actual: status.as_u16().to_string(),
            });
        }

        for (name, expected) in &self.headers {
            let expected_value = trimmed(expected);
            let matched = headers
                .get_all(name)
                .iter()
                .any(|actual| trimmed(actual) == expected_value);
            if !matched {
                let actual = headers
                    .get(name)
                    .map_or_else(|| "<missing>".to_owned(), |v| trimmed(v).to_owned());
                return Err(ExpectationFailure {
                    reason: format!("unexpected header '{name}' (status {})", status.as_u16()),
                    expected: expected_value.to_owned(),
                    actual,
                });
            }
        }

        Ok(())
    }
}

fn trimmed(value: &HeaderValue) -> &str {
    value.to_str().map(str::trim).unwrap_or_default()
}

/// Declarative description of one HTTP call.
///
/// Built once with the consuming setters below and then only read. `name`,
/// `description`, `documentation`, `deprecated` and `labels` are metadata; the
/// client only reports them in traces.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    method: Method,
    path: String,
    description: String,
    documentation: String,
    deprecated: Option<String>,
    labels: BTreeMap<String, String>,
    headers: HeaderMap,
    payload: Option<serde_json::Value>,
    expectation: Expectation,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            description: String::new(),
            documentation: String::new(),
            deprecated: None,
            labels: BTreeMap::new(),
            headers: HeaderMap::new(),
            payload: None,
            expectation: Expectation::default(),
        }
    }

    /// Shorthand for a `GET` endpoint.
    pub fn get(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, Method::Get, path)
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn documentation(mut self, url: impl Into<String>) -> Self {
        self.documentation = url.into();
        self
    }

    #[must_use]
    pub fn deprecated(mut self, note: impl Into<String>) -> Self {
        self.deprecated = Some(note.into());
        self
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set a header, replacing any previous value for the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Like [`Endpoint::header`] for names and values not known to be valid.
    ///
    /// # Errors
    /// `InvalidHeaderName`/`InvalidHeaderValue` when either part is malformed.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, HttpError> {
        let name = HeaderName::from_bytes(name.trim().as_bytes())?;
        let value = HeaderValue::from_str(value.trim())?;
        Ok(self.header(name, value))
    }

    /// Attach a payload; it is encoded per call using the request `Content-Type`.
    ///
    /// # Errors
    /// `Marshal` when `value` cannot be captured as a serde data model value.
    pub fn payload<T>(mut self, value: &T) -> Result<Self, HttpError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value).map_err(|e| HttpError::Marshal {
            content_type: "payload",
            source: e.into(),
        })?;
        self.payload = Some(value);
        Ok(self)
    }

    /// Replace the whole expectation.
    #[must_use]
    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectation = expectation;
        self
    }

    /// Expected status; `None` accepts any status.
    #[must_use]
    pub fn expect_status(mut self, status: Option<StatusCode>) -> Self {
        self.expectation.status = status;
        self
    }

    #[must_use]
    pub fn expect_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.expectation.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn description_text(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn documentation_url(&self) -> &str {
        &self.documentation
    }

    #[must_use]
    pub fn deprecation(&self) -> Option<&str> {
        self.deprecated.as_deref()
    }

    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn payload_value(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn expectation(&self) -> &Expectation {
        &self.expectation
    }

    /// Check the descriptor before use.
    ///
    /// The name must be 1..=63 characters of ASCII letters, digits, space, `_`,
    /// `.` or `-`; the path must be non-empty.
    ///
    /// # Errors
    /// `InvalidEndpoint` describing the first violated rule.
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(HttpError::InvalidEndpoint(format!(
                "name must be 1 to {MAX_NAME_LEN} characters, got {}",
                self.name.len()
            )));
        }
        if let Some(bad) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-')))
        {
            return Err(HttpError::InvalidEndpoint(format!(
                "name '{}' contains invalid character '{bad}'",
                self.name
            )));
        }
        if self.path.trim().is_empty() {
            return Err(HttpError::InvalidEndpoint(format!(
                "endpoint '{}' has an empty path",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, ETAG};

    #[test]
    fn test_method_parse_is_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!(" Patch ".parse::<Method>().unwrap(), Method::Patch);
        assert!(matches!(
            "BREW".parse::<Method>(),
            Err(HttpError::InvalidMethod(m)) if m == "BREW"
        ));
    }

    #[test]
    fn test_method_converts_to_http() {
        for method in Method::ALL {
            let converted: http::Method = method.into();
            assert_eq!(converted.as_str(), method.as_str());
            assert_eq!(Method::try_from(&converted).unwrap(), method);
        }
    }

    #[test]
    fn test_default_expectation_is_200() {
        let endpoint = Endpoint::get("health", "/health");
        assert_eq!(endpoint.expectation().status, Some(StatusCode::OK));
        assert!(endpoint.expectation().headers.is_empty());
    }

    #[test]
    fn test_status_mismatch() {
        let failure = Expectation::default()
            .check(StatusCode::NOT_FOUND, &HeaderMap::new())
            .unwrap_err();
        assert_eq!(failure.expected, "200");
        assert_eq!(failure.actual, "404");
    }

    #[test]
    fn test_any_status_accepted_when_unset() {
        let expectation = Expectation {
            status: None,
            headers: HeaderMap::new(),
        };
        assert!(
            expectation
                .check(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new())
                .is_ok()
        );
    }

    #[test]
    fn test_header_expectations() {
        let endpoint = Endpoint::get("doc", "/doc")
            .expect_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(" application/json "));
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        assert!(endpoint.expectation().check(StatusCode::OK, &headers).is_ok());

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let failure = endpoint
            .expectation()
            .check(StatusCode::OK, &headers)
            .unwrap_err();
        assert_eq!(failure.expected, "application/json");
        assert_eq!(failure.actual, "text/html");

        let failure = endpoint
            .expectation()
            .check(StatusCode::OK, &HeaderMap::new())
            .unwrap_err();
        assert_eq!(failure.actual, "<missing>");
    }

    #[test]
    fn test_validate() {
        assert!(Endpoint::get("list users", "/users").validate().is_ok());
        assert!(Endpoint::get("", "/users").validate().is_err());
        assert!(Endpoint::get("x".repeat(64), "/users").validate().is_err());
        assert!(Endpoint::get("users/list", "/users").validate().is_err());
        assert!(Endpoint::get("users", " ").validate().is_err());
    }

    #[test]
    fn test_builder_carries_metadata() {
        let endpoint = Endpoint::new("create", Method::Post, "/items")
            .description("Create an item")
            .documentation("https://docs.example.com/items")
            .deprecated("use /v2/items")
            .label("team", "storage")
            .try_header("X-Trace", "abc")
            .unwrap()
            .payload(&serde_json::json!({"id": 1}))
            .unwrap();

        assert_eq!(endpoint.method(), Method::Post);
        assert_eq!(endpoint.description_text(), "Create an item");
        assert_eq!(endpoint.documentation_url(), "https://docs.example.com/items");
        assert_eq!(endpoint.deprecation(), Some("use /v2/items"));
        assert_eq!(endpoint.labels().get("team").map(String::as_str), Some("storage"));
        assert_eq!(endpoint.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(endpoint.payload_value(), Some(&serde_json::json!({"id": 1})));
    }
}
