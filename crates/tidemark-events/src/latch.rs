//! One-shot broadcast completion signals.

use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot broadcast latch.
///
/// Every lifecycle condition in the tracking layer (piece done, file done,
/// download done, seeding done, closed) is represented as a `Latch`. The
/// owner triggers it exactly once; triggering again is a no-op. Any number
/// of waiters may observe it, and waiters registered after the trigger
/// return immediately. Clones share the same underlying signal.
#[derive(Clone, Debug)]
pub struct Latch {
    state: Arc<watch::Sender<bool>>,
}

impl Latch {
    /// Create an untriggered latch.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Trigger the latch, waking every current and future waiter.
    ///
    /// Idempotent: only the first call transitions the latch.
    pub fn trigger(&self) {
        self.state.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        });
    }

    /// Whether the latch has already been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the latch is triggered.
    ///
    /// Returns immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives inside `self`, so the channel cannot close while
        // we are waiting on it.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
