//! Per-object failure memory for re-queue timing.
//!
//! The reconciliation core only calls [`RequeueTracker::remember`] after a
//! failure and [`RequeueTracker::forget`] after a success. Deciding when to
//! retry belongs to whoever owns the tracker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub trait RequeueTracker: Send + Sync {
    /// Record a failure for `key`, returning the delay before the next attempt.
    fn remember(&self, key: &str) -> Duration;

    /// Clear the failure history of `key`.
    fn forget(&self, key: &str);
}

/// Exponential per-key backoff: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialRequeue {
    failures: DashMap<String, u32>,
    base: Duration,
    max: Duration,
}

impl ExponentialRequeue {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }
}

impl Default for ExponentialRequeue {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RequeueTracker for ExponentialRequeue {
    fn remember(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        let exponent = (*entry - 1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }

    fn forget(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Shares failure counts with another tracker and reports every failure,
/// with its delay, to whoever schedules the retries.
pub struct NotifyingRequeue {
    inner: Arc<dyn RequeueTracker>,
    retries: UnboundedSender<(String, Duration)>,
}

impl NotifyingRequeue {
    pub fn new(inner: Arc<dyn RequeueTracker>) -> (Self, UnboundedReceiver<(String, Duration)>) {
        let (retries, rx) = mpsc::unbounded();
        (Self { inner, retries }, rx)
    }
}

impl RequeueTracker for NotifyingRequeue {
    fn remember(&self, key: &str) -> Duration {
        let delay = self.inner.remember(key);
        if self.retries.unbounded_send((key.to_string(), delay)).is_err() {
            debug!(key, "retry receiver gone, failure only counted");
        }
        delay
    }

    fn forget(&self, key: &str) {
        self.inner.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let requeue = ExponentialRequeue::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(requeue.remember("n1"), Duration::from_secs(1));
        assert_eq!(requeue.remember("n1"), Duration::from_secs(2));
        assert_eq!(requeue.remember("n1"), Duration::from_secs(4));
        assert_eq!(requeue.remember("n1"), Duration::from_secs(5));
        assert_eq!(requeue.remember("n2"), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_resets() {
        let requeue = ExponentialRequeue::default();
        requeue.remember("n1");
        requeue.remember("n1");
        assert_eq!(requeue.failures("n1"), 2);
        requeue.forget("n1");
        assert_eq!(requeue.failures("n1"), 0);
        assert_eq!(requeue.remember("n1"), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_notifying_requeue_shares_counts_and_reports() {
        let shared = Arc::new(ExponentialRequeue::new(Duration::from_secs(1), Duration::from_secs(60)));
        let (notifying, mut rx) = NotifyingRequeue::new(shared.clone());

        assert_eq!(notifying.remember("node-a"), Duration::from_secs(1));
        assert_eq!(shared.remember("node-a"), Duration::from_secs(2));
        assert_eq!(rx.next().await, Some(("node-a".to_string(), Duration::from_secs(1))));

        notifying.forget("node-a");
        assert_eq!(shared.failures("node-a"), 0);

        drop(rx);
        assert_eq!(notifying.remember("node-b"), Duration::from_secs(1));
    }
}
