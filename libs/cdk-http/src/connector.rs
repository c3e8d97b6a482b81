//! Base connector: TCP tuning, TLS and an optional forward proxy.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use http::uri::Scheme;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, MaybeHttpsStream};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower::Service;

use crate::config::{ClientOptions, TlsRootConfig};
use crate::error::{BoxError, HttpError};
use crate::tls;

/// Connects to origins (or to the forward proxy) with bounded connect + handshake time.
///
/// Without a configured `proxy_uri`, plain `http` targets follow `HTTP_PROXY`
/// and `NO_PROXY` from the environment; loopback hosts are never proxied then.
#[derive(Clone)]
pub struct Connector {
    https: HttpsConnector<HttpConnector>,
    proxy: Option<ProxyRoute>,
    handshake_deadline: Duration,
}

#[derive(Clone, Debug)]
enum ProxyRoute {
    /// `proxy_uri` from the options; every http target goes through it.
    Configured(Uri),
    /// `HTTP_PROXY` from the environment, skipped for `NO_PROXY` hosts.
    Environment { proxy: Uri, no_proxy: NoProxy },
}

/// Host patterns from `NO_PROXY`: `*`, or domains matched with their subdomains.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct NoProxy {
    all: bool,
    domains: Vec<String>,
}

impl NoProxy {
    fn parse(raw: &str) -> Self {
        let mut no_proxy = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                no_proxy.all = true;
                continue;
            }
            let host = match entry.rsplit_once(':') {
                Some((host, port))
                    if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
                {
                    host
                }
                _ => entry,
            };
            let host = host.trim_start_matches("*.").trim_start_matches('.');
            no_proxy.domains.push(host.to_ascii_lowercase());
        }
        no_proxy
    }

    fn matches(&self, host: &str) -> bool {
        self.all
            || self.domains.iter().any(|domain| {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            })
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Read the proxy settings from `lookup` (`HTTP_PROXY`/`http_proxy`,
/// `NO_PROXY`/`no_proxy`). An unparsable proxy value is ignored with a warning.
fn proxy_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<ProxyRoute> {
    let first = |names: [&str; 2]| {
        names
            .into_iter()
            .find_map(|name| lookup(name).filter(|value| !value.trim().is_empty()))
    };

    let raw = first(["HTTP_PROXY", "http_proxy"])?;
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    };
    let proxy = match with_scheme.parse::<Uri>() {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::warn!(value = raw, error = %e, "ignoring invalid HTTP_PROXY");
            return None;
        }
    };
    let no_proxy = first(["NO_PROXY", "no_proxy"])
        .map(|raw| NoProxy::parse(&raw))
        .unwrap_or_default();

    tracing::debug!(%proxy, "using proxy from environment");
    Some(ProxyRoute::Environment { proxy, no_proxy })
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy)
            .field("handshake_deadline", &self.handshake_deadline)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// # Errors
    /// `Transport` when TLS roots cannot be loaded, `InvalidUri` for a bad proxy.
    pub fn new(options: &ClientOptions) -> Result<Self, HttpError> {
        Self::with_env(options, |name| std::env::var(name).ok())
    }

    fn with_env(
        options: &ClientOptions,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, HttpError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(options.connect_timeout));
        http.set_keepalive(Some(options.keep_alive));
        http.set_recv_buffer_size(Some(options.read_buffer_size));
        http.set_send_buffer_size(Some(options.write_buffer_size));

        let https = match options.tls_roots {
            TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(tls::crypto_provider())
                .map_err(|e| HttpError::Transport(Box::new(e)))?
                .https_or_http()
                .enable_all_versions()
                .wrap_connector(http),
            TlsRootConfig::Native => {
                let config = tls::native_roots_client_config()
                    .map_err(|e| HttpError::Transport(e.into()))?;
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_tls_config(config)
                    .https_or_http()
                    .enable_all_versions()
                    .wrap_connector(http)
            }
        };

        let proxy = match options.proxy_uri.as_deref() {
            Some(raw) => Some(ProxyRoute::Configured(raw.parse::<Uri>().map_err(|e| {
                HttpError::InvalidUri {
                    url: raw.to_owned(),
                    reason: e.to_string(),
                }
            })?)),
            None => proxy_from_env(lookup),
        };

        Ok(Self {
            https,
            proxy,
            handshake_deadline: options.connect_timeout + options.tls_handshake_timeout,
        })
    }

    /// Pick the address to dial: the proxy for plain `http` targets, the origin otherwise.
    fn route(&self, dst: Uri) -> Result<(Uri, bool), BoxError> {
        let plain_http = dst.scheme() == Some(&Scheme::HTTP);
        match &self.proxy {
            None => Ok((dst, false)),
            Some(ProxyRoute::Configured(proxy)) if plain_http => Ok((proxy.clone(), true)),
            Some(ProxyRoute::Configured(_)) => Err(format!(
                "cannot reach {dst} through the forward proxy: only plain http targets are proxied"
            )
            .into()),
            Some(ProxyRoute::Environment { proxy, no_proxy }) => {
                let host = dst.host().unwrap_or_default().to_ascii_lowercase();
                if plain_http && !is_loopback(&host) && !no_proxy.matches(&host) {
                    Ok((proxy.clone(), true))
                } else {
                    Ok((dst, false))
                }
            }
        }
    }
}

impl Service<Uri> for Connector {
    type Response = Conn<MaybeHttpsStream<TokioIo<TcpStream>>>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.https.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let (target, proxied) = match self.route(dst) {
            Ok(route) => route,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        tracing::trace!(addr = %target, proxied, "connecting");
        let connecting = self.https.call(target);
        let deadline = self.handshake_deadline;

        Box::pin(async move {
            let stream = tokio::time::timeout(deadline, connecting)
                .await
                .map_err(|_| -> BoxError { Box::new(HttpError::Timeout(deadline)) })??;
            Ok(Conn {
                inner: stream,
                proxied,
            })
        })
    }
}

/// Connection handed to the pool; reports whether it goes through the proxy so
/// requests on it are written in absolute-form.
#[derive(Debug)]
pub struct Conn<T> {
    inner: T,
    proxied: bool,
}

impl<T: Read + Unpin> Read for Conn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: Write + Unpin> Write for Conn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }
}

impl<T: Connection> Connection for Conn<T> {
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}
