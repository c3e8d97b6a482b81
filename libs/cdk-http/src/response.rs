use std::path::Path;

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::body::{self, ResponseBody};
use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::cookies::StoredCookie;
use crate::error::HttpError;
use crate::html::{self, HtmlElement};
use crate::progress::Progress;

/// A completed exchange whose body has not been consumed yet.
///
/// Consuming methods take `self`, so the body is released on every path once
/// the response is dropped. [`close`](Self::close) makes the release explicit.
#[derive(Debug)]
pub struct Response {
    inner: http::Response<ResponseBody>,
}

impl Response {
    pub(crate) fn new(inner: http::Response<ResponseBody>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Cookies set by this response (name and value only).
    #[must_use]
    pub fn cookies(&self) -> Vec<StoredCookie> {
        StoredCookie::from_headers(self.inner.headers())
    }

    /// Declared body length, `None` when absent or removed by a decoding layer.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.inner
            .headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Codec selected by the `Content-Type` header.
    ///
    /// # Errors
    /// `UnsupportedContentType` when the header is missing or not registered.
    pub fn content_type(&self) -> Result<ContentType, HttpError> {
        ContentType::from_headers(self.inner.headers())
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        self.inner.body_mut()
    }

    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.inner.into_body()
    }

    #[must_use]
    pub fn into_inner(self) -> http::Response<ResponseBody> {
        self.inner
    }

    /// Read the whole body.
    ///
    /// # Errors
    /// Body stream failures (`Transport`, `Decode`, ...).
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        let collected = self
            .inner
            .into_body()
            .collect()
            .await
            .map_err(HttpError::from_boxed)?;
        Ok(collected.to_bytes())
    }

    /// Read the whole body as text, replacing invalid UTF-8.
    ///
    /// # Errors
    /// Body stream failures.
    pub async fn text(self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode the body with the codec named by `Content-Type`.
    ///
    /// The header is checked before any body byte is read.
    ///
    /// # Errors
    /// `UnsupportedContentType`, body stream failures, or `Unmarshal`.
    pub async fn unmarshal<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let content_type = self.content_type()?;
        let bytes = self.bytes().await?;
        content_type.unmarshal(&bytes)
    }

    /// Read the body as HTML and return the elements matching the CSS `selector`.
    ///
    /// A body that cannot be read or a selector that does not parse yields no
    /// matches.
    pub async fn html_query(self, selector: &str) -> Vec<HtmlElement> {
        match self.bytes().await {
            Ok(bytes) => html::select(&String::from_utf8_lossy(&bytes), selector),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read html body");
                Vec::new()
            }
        }
    }

    /// Stream the body into a new file at `path`, creating parent directories,
    /// and feed every chunk to `progress`. Returns the number of bytes written.
    ///
    /// A failure leaves the partially written file in place.
    ///
    /// # Errors
    /// `Io` for file system failures, body stream failures otherwise.
    pub async fn save(
        self,
        path: impl AsRef<Path>,
        progress: Option<&Progress>,
    ) -> Result<u64, HttpError> {
        self.save_with_context(&RequestContext::new(), path, progress).await
    }

    /// [`save`](Self::save) that stops with `Canceled` once `ctx` is done.
    ///
    /// Whatever was received before a failure or cancellation is flushed to the
    /// file before the error is returned.
    ///
    /// # Errors
    /// See [`save`](Self::save); `Canceled` when `ctx` finishes first.
    pub async fn save_with_context(
        self,
        ctx: &RequestContext,
        path: impl AsRef<Path>,
        progress: Option<&Progress>,
    ) -> Result<u64, HttpError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;

        let mut body = self.inner.into_body();
        let mut written: u64 = 0;
        let failure = loop {
            let frame = tokio::select! {
                biased;
                () = ctx.done() => break Some(HttpError::Canceled),
                frame = body.frame() => frame,
            };
            let data = match frame {
                None => break None,
                Some(Err(e)) => break Some(HttpError::from_boxed(e)),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
            };
            if let Err(e) = file.write_all(&data).await {
                break Some(HttpError::Io(e));
            }
            if let Some(progress) = progress {
                progress.write(&data);
            }
            written += data.len() as u64;
        };

        if let Some(err) = failure {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %path.display(), error = %e, "failed to flush partial file");
            }
            tracing::debug!(
                path = %path.display(),
                bytes = written,
                error = %err,
                "saving response body aborted"
            );
            return Err(err);
        }
        file.flush().await?;

        tracing::debug!(path = %path.display(), bytes = written, "response body saved");
        Ok(written)
    }

    /// Serialize the status line, headers and optionally the body in HTTP/1.x
    /// wire layout. When the body is included it is buffered and put back, so the
    /// response stays readable.
    ///
    /// # Errors
    /// Body stream failures when `include_body` is set.
    pub async fn dump(&mut self, include_body: bool) -> Result<Vec<u8>, HttpError> {
        let mut out = BytesMut::new();
        out.extend_from_slice(
            format!("{:?} {}\r\n", self.inner.version(), self.inner.status()).as_bytes(),
        );
        for (name, value) in self.inner.headers() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if include_body {
            let taken = std::mem::replace(self.inner.body_mut(), body::empty());
            let bytes = taken
                .collect()
                .await
                .map_err(HttpError::from_boxed)?
                .to_bytes();
            out.extend_from_slice(&bytes);
            *self.inner.body_mut() = body::full(bytes);
        }

        Ok(out.to_vec())
    }

    /// Release the body without reading it.
    pub fn close(self) {
        drop(self);
    }
}

/// Read at most `limit` bytes of `body` for error messages. Stream errors end
/// the excerpt early.
pub(crate) async fn excerpt(mut body: ResponseBody, limit: usize) -> String {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    let take = data.len().min(limit - buf.len());
                    buf.extend_from_slice(&data[..take]);
                }
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "failed to read error response body");
                break;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
