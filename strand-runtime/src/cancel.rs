//! Hierarchical cooperative cancellation
//!
//! Every scheduled task receives a child of its service's root token and
//! is expected to check it between sub-steps. Cancelling the root cancels
//! exactly that service's tokens, never another service's.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Internal cancellation state, shared via `Arc`.
/// A state may have a parent, so cancelling a parent cancels all of its
/// descendants.
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: None,
        })
    }

    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}

/// Cheaply cloneable cancellation token
///
/// Cancelling a token cancels all of its children; cancellation is
/// observed by polling, which keeps tasks' cancellation points explicit.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root token
    pub fn root() -> Self {
        Self {
            state: CancelState::root(),
        }
    }

    /// Create a child token linked to this one
    pub fn child(&self) -> Self {
        Self {
            state: CancelState::child_of(Arc::clone(&self.state)),
        }
    }

    /// Cancel this token and all of its descendants
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Whether this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Sleep until the duration elapses or the token is cancelled.
    /// Returns false if cancelled before the full duration passed.
    pub async fn sleep(&self, total: Duration) -> bool {
        let tick = Duration::from_millis(10);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.is_cancelled() {
                return false;
            }
            let step = tick.min(total - slept);
            tokio::time::sleep(step).await;
            slept += step;
        }
        !self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_starts_uncancelled() {
        let token = CancelToken::root();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_children() {
        let root = CancelToken::root();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let root = CancelToken::root();
        let child = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_siblings_are_independent() {
        let root = CancelToken::root();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::root();
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_sleep_completes_when_uncancelled() {
        let token = CancelToken::root();
        assert!(token.sleep(Duration::from_millis(1)).await);
    }
}
