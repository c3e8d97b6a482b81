use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service, ServiceExt};
use tower_http::decompression::{Decompression, DecompressionBody};

use crate::body::{self, RequestBody, ResponseBody};
use crate::error::{BoxError, HttpError};

/// Value of the `Accept-Encoding` header sent with every request.
pub const ACCEPT_ENCODING_VALUE: &str = "gzip, br";

const GZIP_HEADER_LEN: usize = 10;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_DEFLATE: u8 = 8;
const BROTLI_QUALITY: i32 = 5;

/// Content codings understood in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentCoding {
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "br", alias = "brotli")]
    Brotli,
}

impl ContentCoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Brotli => "br",
        }
    }

    /// Match a `Content-Encoding` value; anything but `gzip`/`br` is `None`.
    #[must_use]
    pub fn from_header(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?.trim();
        if value.eq_ignore_ascii_case("gzip") {
            Some(ContentCoding::Gzip)
        } else if value.eq_ignore_ascii_case("br") {
            Some(ContentCoding::Brotli)
        } else {
            None
        }
    }

    /// Compress a whole buffer.
    ///
    /// # Errors
    /// Propagates encoder I/O failures.
    pub fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ContentCoding::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            ContentCoding::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: BROTLI_QUALITY,
                    ..Default::default()
                };
                let mut output = Vec::new();
                brotli::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
                Ok(output)
            }
        }
    }

    /// Decompress a whole buffer.
    ///
    /// # Errors
    /// `InvalidData`/`UnexpectedEof` style errors for malformed input.
    pub fn decompress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            ContentCoding::Gzip => {
                flate2::read::GzDecoder::new(data).read_to_end(&mut output)?;
            }
            ContentCoding::Brotli => {
                brotli::BrotliDecompress(&mut io::Cursor::new(data), &mut output)?;
            }
        }
        Ok(output)
    }
}

/// Tower layer compressing request bodies and decompressing response bodies.
///
/// Outbound, a body is compressed when the request already declares
/// `Content-Encoding: gzip|br`, or when a forced coding is configured. The body is
/// buffered and `Content-Length` recomputed; empty bodies are sent untouched.
/// `Accept-Encoding: gzip, br` is always set.
///
/// Inbound, `gzip` and `br` responses are decoded as they stream by
/// [`Decompression`], which yields bounded frames. The gzip header is checked
/// before the response is returned. Decoded responses lose their
/// `Content-Encoding` and `Content-Length` headers.
#[derive(Clone, Debug, Default)]
pub struct ContentEncodingLayer {
    force: Option<ContentCoding>,
}

impl ContentEncodingLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress every non-empty request body with `coding`.
    #[must_use]
    pub fn force_request_encoding(mut self, coding: Option<ContentCoding>) -> Self {
        self.force = coding;
        self
    }
}

impl<S> Layer<S> for ContentEncodingLayer {
    type Service = ContentEncodingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContentEncodingService {
            inner: Decompression::new(EncodedBodyCheck { inner }),
            force: self.force,
        }
    }
}

/// Service produced by [`ContentEncodingLayer`]
#[derive(Clone, Debug)]
pub struct ContentEncodingService<S> {
    inner: Decompression<EncodedBodyCheck<S>>,
    force: Option<ContentCoding>,
}

impl<S> Service<Request<RequestBody>> for ContentEncodingService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let force = self.force;

        Box::pin(async move {
            let req = encode_request(req, force).await?;
            let decoded: Pin<
                Box<
                    dyn Future<Output = Result<Response<DecompressionBody<ResponseBody>>, HttpError>>
                        + Send,
                >,
            > = Box::pin(inner.oneshot(req));
            let response = decoded.await?;
            Ok(box_decoded_response(response))
        })
    }
}

fn request_coding(headers: &HeaderMap, force: Option<ContentCoding>) -> Option<ContentCoding> {
    headers
        .get(CONTENT_ENCODING)
        .and_then(ContentCoding::from_header)
        .or(force)
}

async fn encode_request(
    req: Request<RequestBody>,
    force: Option<ContentCoding>,
) -> Result<Request<RequestBody>, HttpError> {
    let (mut parts, payload) = req.into_parts();
    parts
        .headers
        .insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPT_ENCODING_VALUE));

    let Some(coding) = request_coding(&parts.headers, force) else {
        return Ok(Request::from_parts(parts, payload));
    };

    let raw = payload
        .collect()
        .await
        .map_err(|e| HttpError::Io(io::Error::other(e)))?
        .to_bytes();

    if raw.is_empty() {
        parts.headers.remove(CONTENT_ENCODING);
        return Ok(Request::from_parts(parts, body::empty()));
    }

    let compressed = coding.compress(&raw)?;
    tracing::debug!(
        encoding = coding.as_str(),
        original = raw.len(),
        compressed = compressed.len(),
        "compressed request body"
    );

    parts
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(coding.as_str()));
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));

    Ok(Request::from_parts(parts, body::full(compressed)))
}

/// Checks encoded responses before [`Decompression`] sees them.
///
/// Empty encoded bodies lose their `Content-Encoding` so they pass through
/// untouched. A gzip body must start with a valid header or the call fails here,
/// before any response is returned. The coding is recorded as a response
/// extension so decode failures can name it.
#[derive(Clone, Debug)]
pub struct EncodedBodyCheck<S> {
    inner: S,
}

impl<S> Service<Request<RequestBody>> for EncodedBodyCheck<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let response: Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>> =
            Box::pin(inner.oneshot(req));
        Box::pin(async move {
            let response = response.await?;
            check_encoded_body(response).await
        })
    }
}

async fn check_encoded_body(
    response: Response<ResponseBody>,
) -> Result<Response<ResponseBody>, HttpError> {
    let Some(coding) = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(ContentCoding::from_header)
    else {
        return Ok(response);
    };

    let (mut parts, mut encoded) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);

    let wanted = match coding {
        ContentCoding::Gzip => GZIP_HEADER_LEN,
        ContentCoding::Brotli => 1,
    };
    let mut prefix = BytesMut::new();
    while prefix.len() < wanted {
        match encoded.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    prefix.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => return Err(HttpError::from_boxed(e)),
            None => break,
        }
    }

    if prefix.is_empty() {
        parts.headers.remove(CONTENT_ENCODING);
        return Ok(Response::from_parts(parts, body::empty()));
    }
    if coding == ContentCoding::Gzip {
        check_gzip_header(&prefix)?;
    }

    tracing::trace!(encoding = coding.as_str(), "decoding response body");
    parts.extensions.insert(coding);
    let body = Prefixed {
        prefix: Some(prefix.freeze()),
        inner: encoded,
    };
    Ok(Response::from_parts(parts, body.boxed()))
}

fn check_gzip_header(buffered: &[u8]) -> Result<(), HttpError> {
    let invalid = |kind: io::ErrorKind, msg: &str| HttpError::Decode {
        encoding: ContentCoding::Gzip.as_str(),
        source: io::Error::new(kind, msg.to_owned()),
    };

    if buffered.len() < GZIP_HEADER_LEN {
        return Err(invalid(io::ErrorKind::UnexpectedEof, "truncated gzip header"));
    }
    if buffered[..2] != GZIP_MAGIC || buffered[2] != GZIP_DEFLATE {
        return Err(invalid(io::ErrorKind::InvalidData, "invalid gzip header"));
    }
    Ok(())
}

pin_project_lite::pin_project! {
    /// Body replaying bytes already read off `inner` before the rest of it.
    struct Prefixed<B> {
        prefix: Option<Bytes>,
        #[pin]
        inner: B,
    }
}

impl<B> Body for Prefixed<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if let Some(prefix) = this.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        this.inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_none() && self.inner.is_end_stream()
    }
}

/// Box a decompressed body, naming the coding in decoder failures.
fn box_decoded_response(
    response: Response<DecompressionBody<ResponseBody>>,
) -> Response<ResponseBody> {
    let (parts, body) = response.into_parts();
    let coding = parts.extensions.get::<ContentCoding>().copied();
    let body = body.map_err(move |e| decode_failure(coding, e)).boxed();
    Response::from_parts(parts, body)
}

fn decode_failure(coding: Option<ContentCoding>, err: BoxError) -> BoxError {
    if err.is::<HttpError>() {
        return err;
    }
    let Some(coding) = coding else {
        return err;
    };
    let io = match err.downcast::<io::Error>() {
        Ok(io) => *io,
        Err(other) => return other,
    };

    let kind = io.kind();
    let source = match io.into_inner() {
        Some(inner) if inner.is::<HttpError>() => return inner,
        Some(inner) => io::Error::new(kind, inner),
        None => io::Error::from(kind),
    };
    Box::new(HttpError::Decode {
        encoding: coding.as_str(),
        source,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::StatusCode;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Echo service: records the request it saw and answers with a canned response.
    #[derive(Clone)]
    struct StubService {
        seen: Arc<Mutex<Option<(HeaderMap, Bytes)>>>,
        response_headers: HeaderMap,
        response_chunks: Vec<Bytes>,
    }

    impl StubService {
        fn new(response_headers: HeaderMap, response_chunks: Vec<Bytes>) -> Self {
            Self {
                seen: Arc::new(Mutex::new(None)),
                response_headers,
                response_chunks,
            }
        }
    }

    impl Service<Request<RequestBody>> for StubService {
        type Response = Response<ResponseBody>;
        type Error = HttpError;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
            let seen = Arc::clone(&self.seen);
            let headers = self.response_headers.clone();
            let chunks = self.response_chunks.clone();
            Box::pin(async move {
                let (parts, body) = req.into_parts();
                let bytes = body.collect().await.unwrap().to_bytes();
                *seen.lock() = Some((parts.headers, bytes));

                let body = chunked(chunks.into_iter().map(|c| Ok(Frame::data(c))).collect());
                let mut response = Response::new(body);
                *response.status_mut() = StatusCode::OK;
                *response.headers_mut() = headers;
                Ok(response)
            })
        }
    }

    /// Body replaying a fixed list of frames, one per poll.
    struct ChunkedBody(std::collections::VecDeque<Result<Frame<Bytes>, BoxError>>);

    impl Body for ChunkedBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            Poll::Ready(self.0.pop_front())
        }
    }

    fn chunked(frames: Vec<Result<Frame<Bytes>, BoxError>>) -> ResponseBody {
        ChunkedBody(frames.into()).boxed()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    async fn read_all(body: ResponseBody) -> Result<Vec<u8>, HttpError> {
        body.collect()
            .await
            .map(|c| c.to_bytes().to_vec())
            .map_err(HttpError::from_boxed)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    #[test]
    fn test_compression_round_trips() {
        for len in [0, 1, 1024, 64 * 1024, 1024 * 1024 + 17] {
            let data = sample(len);
            for coding in [ContentCoding::Gzip, ContentCoding::Brotli] {
                let compressed = coding.compress(&data).unwrap();
                let restored = coding.decompress(&compressed).unwrap();
                assert_eq!(restored, data, "{} round trip of {len} bytes", coding.as_str());
            }
        }
    }

    #[test]
    fn test_from_header() {
        assert_eq!(
            ContentCoding::from_header(&HeaderValue::from_static(" GZIP ")),
            Some(ContentCoding::Gzip)
        );
        assert_eq!(
            ContentCoding::from_header(&HeaderValue::from_static("br")),
            Some(ContentCoding::Brotli)
        );
        assert_eq!(
            ContentCoding::from_header(&HeaderValue::from_static("deflate")),
            None
        );
    }

    #[tokio::test]
    async fn test_accept_encoding_always_sent() {
        let stub = StubService::new(HeaderMap::new(), vec![Bytes::from_static(b"ok")]);
        let service = ContentEncodingLayer::new().layer(stub.clone());

        let req = Request::new(body::full("plain body"));
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(read_all(response.into_body()).await.unwrap(), b"ok");

        let (sent_headers, sent_body) = stub.seen.lock().clone().unwrap();
        assert_eq!(sent_headers.get(ACCEPT_ENCODING).unwrap(), "gzip, br");
        assert!(sent_headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(sent_body, Bytes::from_static(b"plain body"));
    }

    #[tokio::test]
    async fn test_declared_request_encoding_compresses_body() {
        let stub = StubService::new(HeaderMap::new(), vec![]);
        let service = ContentEncodingLayer::new().layer(stub.clone());

        let payload = sample(10_000);
        let mut req = Request::new(body::full(payload.clone()));
        req.headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        service.oneshot(req).await.unwrap();

        let (sent_headers, sent_body) = stub.seen.lock().clone().unwrap();
        assert_eq!(
            sent_headers.get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(sent_body.len())
        );
        assert_eq!(ContentCoding::Brotli.decompress(&sent_body).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_forced_request_encoding() {
        let stub = StubService::new(HeaderMap::new(), vec![]);
        let service = ContentEncodingLayer::new()
            .force_request_encoding(Some(ContentCoding::Gzip))
            .layer(stub.clone());

        service
            .clone()
            .oneshot(Request::new(body::full("{\"a\":1}")))
            .await
            .unwrap();
        let (sent_headers, sent_body) = stub.seen.lock().clone().unwrap();
        assert_eq!(sent_headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(
            ContentCoding::Gzip.decompress(&sent_body).unwrap(),
            b"{\"a\":1}"
        );

        service.oneshot(Request::new(body::empty())).await.unwrap();
        let (sent_headers, sent_body) = stub.seen.lock().clone().unwrap();
        assert!(sent_headers.get(CONTENT_ENCODING).is_none());
        assert!(sent_body.is_empty());
    }

    #[tokio::test]
    async fn test_failed_request_body_aborts_before_send() {
        let stub = StubService::new(HeaderMap::new(), vec![]);
        let service = ContentEncodingLayer::new()
            .force_request_encoding(Some(ContentCoding::Gzip))
            .layer(stub.clone());

        let frames = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err::<Frame<Bytes>, BoxError>(Box::new(io::Error::other("socket reset"))),
        ];
        let failing = chunked(frames);

        let err = service.oneshot(Request::new(failing)).await.unwrap_err();
        assert!(matches!(err, HttpError::Io(_)));
        assert!(stub.seen.lock().is_none(), "request must not reach the transport");
    }

    #[tokio::test]
    async fn test_gzip_response_streamed_across_frames() {
        let payload = sample(300_000);
        let compressed = Bytes::from(ContentCoding::Gzip.compress(&payload).unwrap());
        // Split so the header itself straddles two frames.
        let chunks = vec![
            compressed.slice(..4),
            compressed.slice(4..1000),
            compressed.slice(1000..),
        ];
        let stub = StubService::new(
            headers(&[("content-encoding", "gzip"), ("content-length", "123")]),
            chunks,
        );

        let response = ContentEncodingLayer::new()
            .layer(stub)
            .oneshot(Request::new(body::empty()))
            .await
            .unwrap();

        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(read_all(response.into_body()).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_decoded_frames_stay_bounded() {
        const MAX_FRAME: usize = 64 * 1024;

        let payload = vec![0u8; 16 * 1024 * 1024];
        for coding in [ContentCoding::Gzip, ContentCoding::Brotli] {
            // The whole compressed stream arrives as one frame.
            let compressed = Bytes::from(coding.compress(&payload).unwrap());
            let mut map = HeaderMap::new();
            map.insert(CONTENT_ENCODING, HeaderValue::from_static(coding.as_str()));
            let stub = StubService::new(map, vec![compressed]);

            let response = ContentEncodingLayer::new()
                .layer(stub)
                .oneshot(Request::new(body::empty()))
                .await
                .unwrap();

            let mut body = response.into_body();
            let (mut total, mut largest) = (0, 0);
            while let Some(frame) = body.frame().await {
                let data = frame.unwrap().into_data().unwrap();
                largest = largest.max(data.len());
                total += data.len();
            }
            assert_eq!(total, payload.len(), "{}", coding.as_str());
            assert!(
                largest <= MAX_FRAME,
                "{} produced a {largest} byte frame",
                coding.as_str()
            );
        }
    }

    #[tokio::test]
    async fn test_brotli_response_decoded() {
        let payload = sample(50_000);
        let compressed = Bytes::from(ContentCoding::Brotli.compress(&payload).unwrap());
        let stub = StubService::new(headers(&[("content-encoding", "br")]), vec![compressed]);

        let response = ContentEncodingLayer::new()
            .layer(stub)
            .oneshot(Request::new(body::empty()))
            .await
            .unwrap();
        assert_eq!(read_all(response.into_body()).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_invalid_gzip_fails_fast() {
        let stub = StubService::new(
            headers(&[("content-encoding", "gzip")]),
            vec![Bytes::from_static(b"this is definitely not gzip")],
        );

        let err = ContentEncodingLayer::new()
            .layer(stub)
            .oneshot(Request::new(body::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Decode { encoding: "gzip", .. }));
    }

    #[tokio::test]
    async fn test_corrupt_brotli_fails_while_reading() {
        let stub = StubService::new(
            headers(&[("content-encoding", "br")]),
            vec![Bytes::from_static(&[0xff; 64])],
        );

        let response = ContentEncodingLayer::new()
            .layer(stub)
            .oneshot(Request::new(body::empty()))
            .await
            .unwrap();
        let err = read_all(response.into_body()).await.unwrap_err();
        assert!(matches!(err, HttpError::Decode { encoding: "br", .. }));
    }

    #[tokio::test]
    async fn test_empty_encoded_body_passes() {
        for coding in ["gzip", "br"] {
            let mut map = HeaderMap::new();
            map.insert(CONTENT_ENCODING, HeaderValue::from_static(coding));
            let stub = StubService::new(map, vec![]);

            let response = ContentEncodingLayer::new()
                .layer(stub)
                .oneshot(Request::new(body::empty()))
                .await
                .unwrap();
            assert!(read_all(response.into_body()).await.unwrap().is_empty());
        }
    }
}
