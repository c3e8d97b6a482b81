#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Outbound HTTP client driven by declarative endpoints
//!
//! A [`Client`] executes [`Endpoint`] descriptors through a fixed tower chain:
//! - **Charset** - response bodies in legacy charsets are transcoded to UTF-8
//! - **Content encoding** - gzip/brotli request compression and response decompression
//! - **Rate limit** - token bucket admission shared by all clones of a client
//! - **Base transport** - pooled hyper client over rustls, with an optional forward proxy
//!
//! Around the chain the client:
//! - Marshals payloads with the codec named by `Content-Type` (JSON, MessagePack,
//!   YAML, HTML, form, plain text)
//! - Replays the cookies of the previous response
//! - Adds browser-like default headers and a `User-Agent`
//! - Checks the response against the endpoint [`Expectation`]
//!
//! Responses can be unmarshalled, queried as HTML with CSS selectors, saved to a
//! file with progress reporting, or dumped for diagnostics.
//!
//! Every call is bounded by a [`RequestContext`] (cancellation token plus an
//! optional deadline).
//!
//! # Example
//!
//! ```ignore
//! use cdk_http::{Client, Endpoint, RequestContext};
//! use std::time::Duration;
//!
//! let mut client = Client::builder()
//!     .base_uri("https://api.example.com")
//!     .requests_per_second(5.0)
//!     .build()?;
//!
//! let ctx = RequestContext::with_timeout(Duration::from_secs(10));
//! let items: Vec<Item> = client
//!     .execute(&ctx, &Endpoint::get("List items", "/items"))
//!     .await?
//!     .unmarshal()
//!     .await?;
//! ```

mod body;
mod builder;
mod client;
mod codec;
pub mod config;
mod connector;
mod context;
mod cookies;
mod download;
mod endpoint;
mod error;
mod html;
pub mod layers;
mod progress;
mod response;
pub mod tls;

pub use body::{RequestBody, ResponseBody};
pub use builder::{ClientBuilder, Transport};
pub use client::Client;
pub use codec::ContentType;
pub use config::{ClientOptions, DEFAULT_USER_AGENT, RateLimitConfig, TlsRootConfig};
pub use context::RequestContext;
pub use cookies::{CookieStore, SharedCookieStore, StoredCookie};
pub use download::{
    DOWNLOAD_REPORT_INTERVAL, download, download_with_options, download_with_progress,
};
pub use endpoint::{Endpoint, Expectation, ExpectationFailure, Method};
pub use error::{BoxError, ERROR_BODY_EXCERPT_LIMIT, HttpError};
pub use html::HtmlElement;
pub use layers::ContentCoding;
pub use progress::{Progress, ProgressReport, ProgressSink, bytes_size};
pub use response::Response;
