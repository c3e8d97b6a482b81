use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation scope of a single call.
///
/// Carries a [`CancellationToken`] and an optional deadline. The client races the
/// whole exchange against [`RequestContext::done`], and the rate limiter observes
/// it while waiting for a token. Clones share the same token.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that is done `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().deadline_at(Instant::now() + timeout)
    }

    /// Context driven by an externally owned token.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set (or tighten) the deadline. An earlier existing deadline is kept.
    #[must_use]
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Child context: canceled with this one, cancelable on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is canceled or its deadline has passed.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_resolves_done() {
        let ctx = RequestContext::new();
        assert!(!ctx.is_done());

        let clone = ctx.clone();
        ctx.cancel();

        tokio::time::timeout(Duration::from_secs(1), clone.done())
            .await
            .expect("done() should resolve after cancel");
        assert!(clone.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_done() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_deadline_only_tightens() {
        let now = Instant::now();
        let ctx = RequestContext::new()
            .deadline_at(now + Duration::from_secs(1))
            .deadline_at(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = RequestContext::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_done());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_done());
    }
}
