//! Cooperative cancellation.
//!
//! A `CancelHandle`/`CancelToken` pair signals an in-flight exchange to stop.
//! Cancellation is cooperative: the adapter aborts network reads, tools check
//! the token between suspension points, and the exchange loop checks it at
//! every state transition. Child scopes (subagents) observe their parent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Handle to request cancellation of an in-flight run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

/// Token for observing cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
    parent: Option<Box<CancelToken>>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Create a new handle + token pair.
    #[must_use]
    pub fn new() -> (Self, CancelToken) {
        let inner = Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            CancelToken {
                inner,
                parent: None,
            },
        )
    }

    /// Trigger cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        CancelHandle::new().1
    }

    /// Check whether cancellation was requested on this scope or any parent.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Create a child scope. Cancelling the child does not affect the
    /// parent; cancelling the parent is observed by the child.
    #[must_use]
    pub fn child(&self) -> (CancelHandle, CancelToken) {
        let (handle, token) = CancelHandle::new();
        let token = CancelToken {
            inner: token.inner,
            parent: Some(Box::new(self.clone())),
        };
        (handle, token)
    }

    /// Wait until cancellation is requested.
    ///
    /// Boxed so child scopes can recurse into their parent's wait.
    pub fn cancelled(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                if self.is_cancelled() {
                    return;
                }
                let own = self.inner.notify.notified();
                match &self.parent {
                    Some(parent) => {
                        let parent_wait = parent.cancelled();
                        tokio::select! {
                            () = own => {}
                            () = parent_wait => {}
                        }
                    }
                    None => own.await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (handle, token) = CancelHandle::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move {
                token.cancelled().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_observes_parent_cancellation() {
        let (parent_handle, parent_token) = CancelHandle::new();
        let (_child_handle, child_token) = parent_token.child();
        assert!(!child_token.is_cancelled());
        parent_handle.cancel();
        assert!(child_token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), child_token.cancelled())
            .await
            .expect("child should observe parent cancel");
    }

    #[tokio::test]
    async fn parent_unaffected_by_child_cancellation() {
        let (_parent_handle, parent_token) = CancelHandle::new();
        let (child_handle, child_token) = parent_token.child();
        child_handle.cancel();
        assert!(child_token.is_cancelled());
        assert!(!parent_token.is_cancelled());
    }
}
