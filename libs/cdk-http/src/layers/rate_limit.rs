use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::{Request, Response};
use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};

use crate::config::RateLimitConfig;
use crate::context::RequestContext;
use crate::error::HttpError;

/// Token bucket shared by every request of one client.
///
/// Capacity is `burst`, refilled at `requests_per_second` (fractional rates
/// allowed). Waiters queue on a fair mutex, so tokens are granted in FIFO order.
pub struct TokenBucket {
    limiter: DefaultDirectRateLimiter,
    queue: Mutex<()>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// # Errors
    /// `InvalidConfig` when the rate or burst is unusable.
    pub fn new(config: RateLimitConfig) -> Result<Self, HttpError> {
        config.validate()?;

        let period = Duration::try_from_secs_f64(1.0 / config.requests_per_second)
            .map_err(|e| HttpError::InvalidConfig(format!("requests_per_second: {e}")))?;
        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| HttpError::InvalidConfig("burst must be at least 1".to_owned()))?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                HttpError::InvalidConfig(format!(
                    "requests_per_second {} is too high",
                    config.requests_per_second
                ))
            })?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            queue: Mutex::new(()),
        })
    }

    /// Suspend until a token is available or `ctx` is done.
    ///
    /// # Errors
    /// `RateLimitCanceled` when `ctx` finishes first; no token is consumed then.
    pub async fn wait(&self, ctx: &RequestContext) -> Result<(), HttpError> {
        let started = tokio::time::Instant::now();

        let admitted = async {
            let _turn = self.queue.lock().await;
            self.limiter.until_ready().await;
        };

        tokio::select! {
            biased;
            () = ctx.done() => {
                tracing::debug!(
                    wait_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "rate limit wait canceled"
                );
                Err(HttpError::RateLimitCanceled)
            }
            () = admitted => {
                let waited = started.elapsed();
                if !waited.is_zero() {
                    tracing::trace!(
                        wait_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "rate limit token granted"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Tower layer gating requests on a shared [`TokenBucket`].
///
/// The request's [`RequestContext`] is read from its extensions; requests
/// without one wait without a cancellation bound.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
}

impl RateLimitLayer {
    /// # Errors
    /// `InvalidConfig` when the rate or burst is unusable.
    pub fn new(config: RateLimitConfig) -> Result<Self, HttpError> {
        Ok(Self {
            bucket: Arc::new(TokenBucket::new(config)?),
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
        }
    }
}

/// Service produced by [`RateLimitLayer`]
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: 'static,
{
    type Response = Response<ResBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner service is awaited after the token is granted.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let bucket = Arc::clone(&self.bucket);
        let ctx = req
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();

        Box::pin(async move {
            bucket.wait(&ctx).await?;
            inner.oneshot(req).await
        })
    }
}
