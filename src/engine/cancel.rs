//! Cooperative, run-scoped cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cancellation flag for one run.
///
/// Cancellation is cooperative: the engine checks the flag at stage
/// boundaries and races [`cancelled`](CancelToken::cancelled) against backoff
/// sleeps; stage implementations may additionally poll it inside long
/// operations. The engine never interrupts an in-flight collaborator call,
/// so worst-case latency is the remaining execution time of the current
/// stage attempt.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes any waiter parked in a backoff sleep.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register before re-checking so a concurrent cancel() between
            // the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
