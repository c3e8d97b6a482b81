use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use encoding_rs::{Encoding, REPLACEMENT, UTF_8};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, Response};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use tower::{Layer, Service, ServiceExt};

use crate::body::ResponseBody;
use crate::error::{BoxError, HttpError};

/// Tower layer re-encoding response bodies to UTF-8.
///
/// Reads the `charset` parameter of the response `Content-Type`. No parameter or
/// a UTF-8 charset leaves the response untouched. A charset without a decoder
/// fails the call with [`HttpError::UnsupportedCharset`]. Transcoded responses
/// advertise `charset=utf-8` and lose their `Content-Length`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CharsetLayer;

impl CharsetLayer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CharsetLayer {
    type Service = CharsetService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CharsetService { inner }
    }
}

/// Service produced by [`CharsetLayer`]
#[derive(Clone, Debug)]
pub struct CharsetService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for CharsetService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.oneshot(req).await?;
            transcode_response(response)
        })
    }
}

/// Decoder target of a response, `None` when no transcoding is needed.
fn response_encoding(
    value: &HeaderValue,
) -> Result<Option<(&'static Encoding, String)>, HttpError> {
    let invalid = |reason: String| HttpError::InvalidContentType {
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        reason,
    };

    let raw = value.to_str().map_err(|e| invalid(e.to_string()))?;
    let media: mime::Mime = raw.parse().map_err(|e: mime::FromStrError| invalid(e.to_string()))?;

    let Some(charset) = media.get_param(mime::CHARSET) else {
        return Ok(None);
    };
    let label = charset.as_str();

    let encoding = Encoding::for_label(label.as_bytes())
        .filter(|encoding| *encoding != REPLACEMENT)
        .ok_or_else(|| HttpError::UnsupportedCharset {
            charset: label.to_owned(),
        })?;

    if encoding == UTF_8 {
        return Ok(None);
    }

    Ok(Some((encoding, format!("{}; charset=utf-8", media.essence_str()))))
}

fn transcode_response(
    response: Response<ResponseBody>,
) -> Result<Response<ResponseBody>, HttpError> {
    let Some(value) = response.headers().get(CONTENT_TYPE) else {
        return Ok(response);
    };
    let Some((encoding, utf8_content_type)) = response_encoding(value)? else {
        return Ok(response);
    };

    tracing::debug!(charset = encoding.name(), "transcoding response body to UTF-8");

    let (mut parts, body) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    if let Ok(value) = HeaderValue::from_str(&utf8_content_type) {
        parts.headers.insert(CONTENT_TYPE, value);
    }

    let transcoded = TranscodedBody {
        inner: body,
        decoder: Some(encoding.new_decoder()),
    };
    Ok(Response::from_parts(parts, transcoded.boxed()))
}

pin_project_lite::pin_project! {
    /// Body that decodes its inner byte stream from a legacy charset into UTF-8.
    pub struct TranscodedBody<B> {
        #[pin]
        inner: B,
        decoder: Option<encoding_rs::Decoder>,
    }
}

fn decode_chunk(
    decoder: &mut encoding_rs::Decoder,
    input: &[u8],
    last: bool,
) -> Result<Bytes, BoxError> {
    let capacity = decoder
        .max_utf8_buffer_length(input.len())
        .ok_or("charset decoder buffer size overflow")?;
    let mut output = String::with_capacity(capacity);
    let (_, read, _) = decoder.decode_to_string(input, &mut output, last);
    debug_assert_eq!(read, input.len());
    Ok(Bytes::from(output))
}

impl<B> Body for TranscodedBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        loop {
            let Some(decoder) = this.decoder.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        let decoded = decode_chunk(decoder, &data, false);
                        match decoded {
                            Ok(text) if text.is_empty() => {}
                            Ok(text) => return Poll::Ready(Some(Ok(Frame::data(text)))),
                            Err(e) => {
                                *this.decoder = None;
                                return Poll::Ready(Some(Err(e)));
                            }
                        }
                    }
                    Err(trailers) => return Poll::Ready(Some(Ok(trailers))),
                },
                Some(Err(e)) => {
                    *this.decoder = None;
                    return Poll::Ready(Some(Err(e.into())));
                }
                None => {
                    let Some(mut decoder) = this.decoder.take() else {
                        return Poll::Ready(None);
                    };
                    return match decode_chunk(&mut decoder, &[], true) {
                        Ok(text) if text.is_empty() => Poll::Ready(None),
                        Ok(text) => Poll::Ready(Some(Ok(Frame::data(text)))),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone)]
    struct FixedResponse {
        content_type: Option<&'static str>,
        chunks: Vec<Bytes>,
    }

    struct Chunks(VecDeque<Bytes>);

    impl Body for Chunks {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            Poll::Ready(self.0.pop_front().map(|b| Ok(Frame::data(b))))
        }
    }

    impl Service<Request<()>> for FixedResponse {
        type Response = Response<ResponseBody>;
        type Error = HttpError;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<()>) -> Self::Future {
            let mut response = Response::new(Chunks(self.chunks.clone().into()).boxed());
            if let Some(ct) = self.content_type {
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(ct));
            }
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("1"));
            std::future::ready(Ok(response))
        }
    }

    async fn call(
        content_type: Option<&'static str>,
        chunks: Vec<Bytes>,
    ) -> Result<Response<ResponseBody>, HttpError> {
        CharsetLayer::new()
            .layer(FixedResponse {
                content_type,
                chunks,
            })
            .oneshot(Request::new(()))
            .await
    }

    async fn text(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_latin1_e_acute_becomes_utf8() {
        let response = call(
            Some("text/plain; charset=iso-8859-1"),
            vec![Bytes::from_static(b"caf\xe9")],
        )
        .await
        .unwrap();

        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(text(response).await, "café");
    }

    #[tokio::test]
    async fn test_multibyte_sequence_split_across_frames() {
        // "日本" in Shift_JIS is 93 fa 96 7b; split inside the first character.
        let response = call(
            Some("text/html; charset=Shift_JIS"),
            vec![
                Bytes::from_static(b"\x93"),
                Bytes::from_static(b"\xfa\x96"),
                Bytes::from_static(b"\x7b"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(text(response).await, "日本");
    }

    #[tokio::test]
    async fn test_utf8_and_missing_charset_untouched() {
        for content_type in [Some("application/json; charset=UTF-8"), Some("text/plain"), None] {
            let response = call(content_type, vec![Bytes::from_static(b"{}")])
                .await
                .unwrap();
            assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "1");
            assert_eq!(text(response).await, "{}");
        }
    }

    #[tokio::test]
    async fn test_unknown_charset_rejected() {
        let err = call(Some("text/plain; charset=klingon"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpError::UnsupportedCharset { charset } if charset == "klingon"
        ));
    }

    #[tokio::test]
    async fn test_malformed_content_type_rejected() {
        let err = call(Some("not a media type"), vec![]).await.unwrap_err();
        assert!(matches!(err, HttpError::InvalidContentType { .. }));
    }

    #[tokio::test]
    async fn test_empty_body_transcodes_to_empty() {
        let response = call(Some("text/plain; charset=windows-1251"), vec![])
            .await
            .unwrap();
        assert!(text(response).await.is_empty());
    }
}
