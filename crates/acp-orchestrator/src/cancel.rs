// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation for run actors.
//!
//! Cancellation is a signal, not an interrupt: the run actor consumes it at
//! its next suspension point (approval waits, tool calls, backoff sleeps).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// An operator or API caller asked for cancellation.
    Requested,
    /// The run exceeded its overall deadline.
    DeadlineExceeded,
    /// The host is shutting down.
    Shutdown,
}

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// A cloneable cancellation signal shared by a run's actor and its
/// controllers.
///
/// All clones share state; the first recorded reason wins and later cancels
/// are harmless.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl CancelSignal {
    /// A signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the signal. Idempotent; only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The recorded reason, once fired.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.lock().ok().and_then(|r| *r)
    }

    /// Resolve when the signal fires (immediately if it already has).
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

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unfired() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.reason().is_none());
    }

    #[test]
    fn clones_share_state() {
        let a = CancelSignal::new();
        let b = a.clone();
        a.cancel(CancelReason::Requested);
        assert!(b.is_cancelled());
        assert_eq!(b.reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn first_reason_wins() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::DeadlineExceeded);
        signal.cancel(CancelReason::Requested);
        assert_eq!(signal.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        signal.cancel(CancelReason::Shutdown);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn already_fired_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Requested);
        signal.cancelled().await;
    }
}
