use std::path::Path;
use std::time::Duration;

use crate::client::Client;
use crate::config::{ClientOptions, parse_http_url};
use crate::context::RequestContext;
use crate::endpoint::Endpoint;
use crate::error::HttpError;
use crate::progress::Progress;

/// How often a running download reports progress.
pub const DOWNLOAD_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Fetch `uri` into a file at `path`, reporting progress through `tracing`.
///
/// Uses a default client scoped to the URI's origin and returns the number of
/// bytes written. Any failure aborts the transfer; a partially written file is
/// left in place.
///
/// # Errors
/// `InvalidUri` for a non-http(s) URI, otherwise any error of
/// [`Client::execute`] or [`Response::save`](crate::Response::save).
pub async fn download(
    ctx: &RequestContext,
    uri: &str,
    path: impl AsRef<Path>,
) -> Result<u64, HttpError> {
    let path = path.as_ref();
    let label = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
    download_with_progress(ctx, uri, path, &Progress::new(label, 0)).await
}

/// [`download`] reporting through a caller-supplied [`Progress`]. Its total is
/// set from the response `Content-Length`; it is always stopped on return.
///
/// # Errors
/// See [`download`].
pub async fn download_with_progress(
    ctx: &RequestContext,
    uri: &str,
    path: impl AsRef<Path>,
    progress: &Progress,
) -> Result<u64, HttpError> {
    download_with_options(ctx, ClientOptions::default(), uri, path, progress).await
}

/// [`download_with_progress`] over a client built from `options`. The base URI
/// is replaced by the origin of `uri`.
///
/// # Errors
/// See [`download`]; also any error of [`ClientBuilder::build`](crate::ClientBuilder::build).
pub async fn download_with_options(
    ctx: &RequestContext,
    options: ClientOptions,
    uri: &str,
    path: impl AsRef<Path>,
    progress: &Progress,
) -> Result<u64, HttpError> {
    let result = transfer(ctx, options, uri, path.as_ref(), progress).await;
    progress.stop().await;
    result
}

async fn transfer(
    ctx: &RequestContext,
    options: ClientOptions,
    uri: &str,
    path: &Path,
    progress: &Progress,
) -> Result<u64, HttpError> {
    let url = parse_http_url(uri)?;
    let origin = url.origin().ascii_serialization();
    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    };

    let mut client = Client::builder()
        .options(options)
        .base_uri(origin)
        .build()?;
    let response = client
        .execute(ctx, &Endpoint::get("Download file", target))
        .await?;

    if let Some(total) = response.content_length() {
        progress.set_total(total);
    }
    progress.start(DOWNLOAD_REPORT_INTERVAL);
    tracing::debug!(%url, path = %path.display(), total = progress.total(), "downloading");

    response.save_with_context(ctx, path, Some(progress)).await
}
