//! Per-slot watchdog
//!
//! One deadline per pipeline slot. A timer thread sleeps until the earliest
//! deadline and hands expired `(slot, frame)` pairs to the scheduler, which
//! then races the done path for the slot token. Cancelling never blocks on
//! the timer thread.

use crate::frame::FrameId;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{trace, warn};
use xpu_proto::limits::TIKTOK_SLOTS;

#[derive(Debug, Clone, Copy)]
struct Deadline {
    frame: FrameId,
    at: Instant,
}

#[derive(Debug, Default)]
struct Timers {
    slots: [Option<Deadline>; TIKTOK_SLOTS],
    stopped: bool,
}

/// What the timer thread should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// A slot's deadline passed
    Expired {
        /// Slot index
        slot: usize,
        /// Frame that was armed
        frame: FrameId,
    },
    /// The watchdog was stopped
    Stopped,
}

/// Longest timeout a deadline can carry; larger values are clamped
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deadlines for both slots
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    timers: Mutex<Timers>,
    cond: Condvar,
}

impl Watchdog {
    /// Watchdog with the given per-frame timeout, at most [`MAX_TIMEOUT`]
    pub fn new(timeout: Duration) -> Self {
        if timeout > MAX_TIMEOUT {
            warn!("Watchdog timeout {timeout:?} clamped to {MAX_TIMEOUT:?}");
        }
        Self {
            timeout: timeout.min(MAX_TIMEOUT),
            timers: Mutex::new(Timers::default()),
            cond: Condvar::new(),
        }
    }

    /// Configured timeout
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the timer for `frame` in `slot`
    pub fn arm(&self, slot: usize, frame: FrameId) {
        let now = Instant::now();
        let at = now.checked_add(self.timeout).unwrap_or(now + MAX_TIMEOUT);
        let mut timers = self.timers.lock();
        timers.slots[slot] = Some(Deadline { frame, at });
        trace!("Watchdog armed: slot {slot}, frame {frame}");
        self.cond.notify_all();
    }

    /// Stop the timer for `frame` in `slot`; returns whether it was armed
    pub fn cancel(&self, slot: usize, frame: FrameId) -> bool {
        let mut timers = self.timers.lock();
        match timers.slots[slot] {
            Some(d) if d.frame == frame => {
                timers.slots[slot] = None;
                true
            }
            _ => false,
        }
    }

    /// Wake the timer thread and make it return [`Expiry::Stopped`]
    pub fn stop(&self) {
        self.timers.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Block until a deadline passes or the watchdog stops
    ///
    /// An expired deadline is disarmed before it is returned.
    pub fn next_expiry(&self) -> Expiry {
        let mut timers = self.timers.lock();
        loop {
            if timers.stopped {
                return Expiry::Stopped;
            }
            let now = Instant::now();
            let earliest = timers
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, d)| d.map(|d| (slot, d)))
                .min_by_key(|(_, d)| d.at);
            match earliest {
                Some((slot, d)) if d.at <= now => {
                    timers.slots[slot] = None;
                    return Expiry::Expired {
                        slot,
                        frame: d.frame,
                    };
                }
                Some((_, d)) => {
                    let _ = self.cond.wait_until(&mut timers, d.at);
                }
                None => self.cond.wait(&mut timers),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const F: FrameId = FrameId {
        index: 1,
        generation: 0,
    };

    #[test]
    fn armed_slot_expires() {
        let dog = Watchdog::new(Duration::from_millis(5));
        dog.arm(1, F);
        assert_eq!(dog.next_expiry(), Expiry::Expired { slot: 1, frame: F });
        assert!(!dog.cancel(1, F));
    }

    #[test]
    fn cancelled_slot_does_not_expire() {
        let dog = Arc::new(Watchdog::new(Duration::from_millis(5)));
        dog.arm(0, F);
        assert!(dog.cancel(0, F));
        let timer = {
            let dog = Arc::clone(&dog);
            std::thread::spawn(move || dog.next_expiry())
        };
        std::thread::sleep(Duration::from_millis(30));
        dog.stop();
        assert_eq!(timer.join().unwrap(), Expiry::Stopped);
    }

    #[test]
    fn cancel_requires_matching_frame() {
        let dog = Watchdog::new(Duration::from_secs(60));
        dog.arm(0, F);
        assert!(!dog.cancel(0, FrameId { index: 1, generation: 1 }));
        assert!(dog.cancel(0, F));
    }

    #[test]
    fn earliest_deadline_first() {
        let dog = Watchdog::new(Duration::from_millis(20));
        dog.arm(1, F);
        std::thread::sleep(Duration::from_millis(5));
        let g = FrameId { index: 2, generation: 0 };
        dog.arm(0, g);
        assert_eq!(dog.next_expiry(), Expiry::Expired { slot: 1, frame: F });
        assert_eq!(dog.next_expiry(), Expiry::Expired { slot: 0, frame: g });
    }

    #[test]
    fn huge_timeout_is_clamped() {
        let dog = Watchdog::new(Duration::from_millis(u64::MAX));
        assert_eq!(dog.timeout(), MAX_TIMEOUT);
        dog.arm(0, F);
        assert!(dog.cancel(0, F));
    }
}
