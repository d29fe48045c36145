//! Scheduler-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters, readable while the scheduler runs
#[derive(Debug, Default)]
pub struct SchedStats {
    submitted: AtomicU64,
    sent: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    stale_messages: AtomicU64,
    dropped_events: AtomicU64,
    protocol_violations: AtomicU64,
    relayed: AtomicU64,
}

/// Point-in-time copy of [`SchedStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames accepted by `submit`
    pub submitted: u64,
    /// Frames handed to the remote cores
    pub sent: u64,
    /// Frames finished successfully
    pub completed: u64,
    /// Frames reclaimed by the watchdog
    pub timed_out: u64,
    /// Frames failed for any other reason
    pub failed: u64,
    /// Messages dropped because their slot had moved on
    pub stale_messages: u64,
    /// Event sink notifications dropped on a full cache
    pub dropped_events: u64,
    /// Malformed or impossible messages
    pub protocol_violations: u64,
    /// Cross-core decrements relayed by the host
    pub relayed: u64,
}

impl StatsSnapshot {
    /// Frames in a terminal state
    pub const fn finished(&self) -> u64 {
        self.completed + self.timed_out + self.failed
    }
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Count one `", stringify!($field), "` event")]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl SchedStats {
    bump! {
        on_submit => submitted,
        on_send => sent,
        on_complete => completed,
        on_timeout => timed_out,
        on_failure => failed,
        on_stale => stale_messages,
        on_dropped_event => dropped_events,
        on_protocol_violation => protocol_violations,
        on_relay => relayed,
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale_messages: self.stale_messages.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SchedStats::default();
        stats.on_submit();
        stats.on_submit();
        stats.on_complete();
        stats.on_timeout();
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.finished(), 2);
        assert_eq!(snap.failed, 0);
    }
}
