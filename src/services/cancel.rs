//! Cooperative cancellation token.
//!
//! Handlers receive a token and are expected to poll or await it at their
//! suspension points. The runner still enforces a hard deadline around the
//! handler future; the token exists so well-behaved handlers can stop
//! cleanly before the deadline tears them down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl Inner {
    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Clonable cancellation handle. A child token observes its parent's
/// cancellation but can be cancelled independently without affecting it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    own: Arc<Inner>,
    parent: Option<Arc<Inner>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that fires when either it or `self` is cancelled.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            own: Arc::new(Inner::default()),
            parent: Some(self.own.clone()),
        }
    }

    pub fn cancel(&self) {
        self.own.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.is_cancelled() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once the token (or its parent) is cancelled.
    pub async fn cancelled(&self) {
        match &self.parent {
            Some(parent) => {
                tokio::select! {
                    () = self.own.cancelled() => {}
                    () = parent.cancelled() => {}
                }
            }
            None => self.own.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_touch_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
