//! Out-of-band wake-up between execution contexts
//!
//! Stands in for the inter-core interrupt: a sender rings after publishing a
//! message, the receiving context sleeps on it between drains. Rings are
//! counted, so a ring that arrives before the wait is never lost.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counting doorbell
#[derive(Debug, Default)]
pub struct Doorbell {
    pending: Mutex<u64>,
    cond: Condvar,
}

impl Doorbell {
    /// Create an idle doorbell
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring the doorbell, waking any waiter
    pub fn ring(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_add(1);
        self.cond.notify_all();
    }

    /// Wait until rung or `timeout` elapses
    ///
    /// Returns `true` if at least one ring was consumed. All pending rings are
    /// consumed at once; the caller is expected to drain everything.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if *pending == 0 {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        let rung = *pending > 0;
        *pending = 0;
        rung
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ring_before_wait_is_not_lost() {
        let bell = Doorbell::new();
        bell.ring();
        assert!(bell.wait_timeout(Duration::from_millis(1)));
        assert!(!bell.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn ring_wakes_waiter() {
        let bell = Arc::new(Doorbell::new());
        let waiter = {
            let bell = Arc::clone(&bell);
            std::thread::spawn(move || bell.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        bell.ring();
        assert!(waiter.join().unwrap());
    }
}
