//! Single-assignment outcome handles.
//!
//! A [`Tracked`] wraps either an immediate value or a pending result that
//! will be written exactly once. Its settled state is observable without
//! awaiting, which is what lets the connection engine answer a duplicate
//! delivery with "still processing" versus replaying the original response.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::Notify;

/// A single-assignment observable outcome.
///
/// Cloning yields another handle to the same slot. The first
/// [`settle`](Tracked::settle) wins; later writes are rejected.
pub struct Tracked<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: OnceLock<T>,
    notify: Notify,
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Tracked<T> {
    /// An unsettled outcome.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// An outcome settled at construction.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let tracked = Self::pending();
        let _ = tracked.inner.value.set(value);
        tracked
    }

    /// Settle the outcome. Returns `false` if it was already settled.
    pub fn settle(&self, value: T) -> bool {
        let won = self.inner.value.set(value).is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    /// Whether the outcome has not been settled yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.value.get().is_none()
    }

    /// The settled value, without awaiting.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.inner.value.get().cloned()
    }

    /// Wait for the outcome to settle.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(value) = self.inner.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}
