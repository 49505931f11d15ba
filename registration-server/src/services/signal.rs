//! Wake-up for the backup scheduler when the backup policy changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Level-triggered flag: any number of raises before the scheduler looks
/// collapse into a single wake-up. The scheduler re-reads the settings when
/// woken, so the signal carries no payload.
#[derive(Debug, Default)]
pub struct ReconfigureSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl ReconfigureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        // Wakes current waiters only; a raise with nobody waiting lives in
        // the flag alone.
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::SeqCst)
    }

    /// Waits up to `timeout` for a raise. Returns immediately if the flag is
    /// already set; the flag is left for the caller to [`take`](Self::take).
    pub async fn wait(&self, timeout: Duration) -> bool {
        // Registered before the flag check so a raise in between still wakes us.
        let notified = self.notify.notified();
        if self.is_raised() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.is_raised()
    }
}
