//! Cooperative cancellation (§4.4, §4.5, §5).
//!
//! Mirrors the shutdown pattern the reference transport session keeps
//! (an `AtomicBool` flag paired with a notification channel) without
//! pulling in a dedicated cancellation-token crate: `CancellationToken`
//! is just that pair, generalised to fan out to arbitrarily many waiters
//! via [`tokio::sync::Notify`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cheaply-cloneable handle that can be cancelled once, from any clone,
/// and observed by any number of waiters (§4.4: "cancellation propagates
/// to every task awaiting this call").
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken { inner: Arc::new(Inner::default()) }
    }

    /// Derive a clone tied to the same cancellation — there is no parent/child
    /// distinction here (§4.4's cancellation model is flat: a call's token
    /// and any task it spawns share one signal).
    pub fn child_token(&self) -> CancellationToken {
        self.clone()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Arm `token` to cancel itself after `duration`, returning a flag the
/// caller can consult to tell a deadline-triggered cancellation apart from
/// an ordinary one (§5: "Deadlines ... enforced by a per-stream timer; on
/// expiry the runtime treats it as cancellation with DEADLINE_EXCEEDED").
/// The timer task exits without marking the flag if `token` is cancelled
/// for some other reason first.
pub(crate) fn arm_deadline(token: CancellationToken, duration: Duration) -> Arc<AtomicBool> {
    let expired = Arc::new(AtomicBool::new(false));
    let flag = expired.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                flag.store(true, Ordering::Release);
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("cancellation should wake the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_token_shares_cancellation() {
        let token = CancellationToken::new();
        let child = token.child_token();
        token.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_timer_cancels_and_marks_expired() {
        let token = CancellationToken::new();
        let expired = arm_deadline(token.clone(), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_millis(200), token.cancelled()).await.unwrap();
        assert!(expired.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn deadline_timer_does_not_mark_expired_on_unrelated_cancel() {
        let token = CancellationToken::new();
        let expired = arm_deadline(token.clone(), Duration::from_secs(10));
        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!expired.load(Ordering::Acquire));
    }
}
