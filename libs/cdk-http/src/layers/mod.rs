//! Tower layers forming the client transport chain.
//!
//! The chain is always composed outermost first as
//! `Charset(ContentEncoding(RateLimit(base)))`:
//!
//! - [`CharsetLayer`] - transcodes response bodies to UTF-8
//! - [`ContentEncodingLayer`] - compresses requests, decompresses responses (gzip, brotli)
//! - [`RateLimitLayer`] - token bucket admission with cancellable waits

mod charset;
mod content_encoding;
mod rate_limit;

pub use charset::{CharsetLayer, CharsetService, TranscodedBody};
pub use content_encoding::{
    ACCEPT_ENCODING_VALUE, ContentCoding, ContentEncodingLayer, ContentEncodingService,
    EncodedBodyCheck,
};
pub use rate_limit::{RateLimitLayer, RateLimitService, TokenBucket};
