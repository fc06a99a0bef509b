//! Per-session cancellation events.
//!
//! Each live session carries one `CancelEvent`.  Setting it signals the
//! stream loop to stop the current turn cleanly; the loop can also await
//! it so a cancel interrupts a blocked transport read.  Clearing installs
//! a fresh token so the event is reusable across turns.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct CancelEvent {
    inner: Arc<Mutex<CancellationToken>>,
}

impl CancelEvent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Signal cancellation.
    pub fn set(&self) {
        self.inner.lock().cancel();
    }

    /// Check whether cancellation has been requested.
    pub fn is_set(&self) -> bool {
        self.inner.lock().is_cancelled()
    }

    /// Reset for the next turn.  Waiters on the old token are unaffected.
    pub fn clear(&self) {
        *self.inner.lock() = CancellationToken::new();
    }

    /// Resolve once cancellation is signalled.
    pub async fn wait(&self) {
        let token = self.inner.lock().clone();
        token.cancelled().await;
    }
}

impl Default for CancelEvent {
    fn default() -> Self {
        Self::new()
    }
}
