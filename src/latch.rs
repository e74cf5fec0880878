//! Process-wide connect latch.
//!
//! Serializes connection attempts across all tabs. The latch stays held for
//! a cool-off period after an attempt resolves, so duplicate connect
//! requests fired in quick succession (a click plus an automatic reconnect)
//! collapse into one socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Global "connection in progress" latch with delayed release.
#[derive(Debug, Clone, Default)]
pub struct ConnectLatch {
    held: Arc<AtomicBool>,
}

impl ConnectLatch {
    /// Unheld latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch. Returns `false` if it is already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a connect is in progress or cooling off.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Release the latch once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn release_after(&self, delay: Duration) {
        let held = Arc::clone(&self.held);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            held.store(false, Ordering::Release);
            log::trace!("[Registry] Connect latch released");
        });
    }
}
