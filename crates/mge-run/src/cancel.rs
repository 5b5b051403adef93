//! Cancellation primitives for a single run: an atomic flag plus a
//! `Notify` so every job awaiting a layer barrier wakes the moment
//! cancellation is signalled, and a first-reason-wins wrapper for
//! reporting why a run stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one
/// immediately makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A future that resolves the moment the token is cancelled, or
    /// immediately if it already is.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a run was cancelled (spec §5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    UserRequested,
    Timeout,
    BudgetExhausted,
    PolicyViolation,
    SystemShutdown,
}

impl CancellationReason {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::UserRequested => "cancelled by user request",
            Self::Timeout => "cancelled due to timeout",
            Self::BudgetExhausted => "cancelled because budget was exhausted",
            Self::PolicyViolation => "cancelled due to policy violation",
            Self::SystemShutdown => "cancelled because the system is shutting down",
        }
    }
}

/// Wraps a [`CancellationToken`] together with the first reason it was
/// cancelled for.
#[derive(Debug, Clone)]
pub struct CancellableRun {
    token: CancellationToken,
    reason: Arc<std::sync::Mutex<Option<CancellationReason>>>,
}

impl CancellableRun {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Cancel the run. Only the first reason across repeated calls sticks.
    pub fn cancel(&self, reason: CancellationReason) {
        {
            let mut guard = self.reason.lock().expect("reason lock poisoned");
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancellationReason> {
        self.reason.lock().expect("reason lock poisoned").clone()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_not_cancelled() {
        assert!(!CancellationToken::new().is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn cancellable_run_keeps_first_reason() {
        let run = CancellableRun::new(CancellationToken::new());
        run.cancel(CancellationReason::Timeout);
        run.cancel(CancellationReason::UserRequested);
        assert_eq!(run.reason(), Some(CancellationReason::Timeout));
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_once_flagged() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
