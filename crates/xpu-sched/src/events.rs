//! Mid-frame events: pause list and event sink cache

use crate::error::{Result, SchedError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;
use xpu_proto::limits::MAX_PAUSE_OPS;

// ── Pause list ───────────────────────────────────────────────────────────────

/// Operators that stop after completing until the host resumes them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseList {
    ops: Vec<u16>,
}

impl PauseList {
    /// Validated pause list for a model with `op_count` operators
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ResourceExhausted`] past [`MAX_PAUSE_OPS`]
    /// entries and [`SchedError::InvalidGraph`] for an unknown operator.
    pub fn new(ops: &[u16], op_count: usize) -> Result<Self> {
        if ops.len() > MAX_PAUSE_OPS {
            return Err(SchedError::exhausted("pause list", MAX_PAUSE_OPS));
        }
        if let Some(bad) = ops.iter().find(|op| usize::from(**op) >= op_count) {
            return Err(SchedError::invalid_graph(format!(
                "pause operator {bad} out of range ({op_count} operators)"
            )));
        }
        let mut ops = ops.to_vec();
        ops.sort_unstable();
        ops.dedup();
        Ok(Self { ops })
    }

    /// Whether `op` pauses
    pub fn contains(&self, op: u16) -> bool {
        self.ops.binary_search(&op).is_ok()
    }

    /// Paused operators, ascending
    pub fn ops(&self) -> &[u16] {
        &self.ops
    }

    /// Whether nothing pauses
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── Event sink cache ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheState {
    ring: VecDeque<u16>,
    dropped: u64,
}

/// Bounded queue of event sink notifications for one context
///
/// A full cache drops the incoming notification; nothing already queued is
/// overwritten.
#[derive(Debug)]
pub struct EventCache {
    state: Mutex<CacheState>,
    cond: Condvar,
    capacity: usize,
}

impl EventCache {
    /// Cache holding at most `capacity` notifications
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                ring: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Queue a notification; returns `false` if it was dropped
    pub fn push(&self, event: u16) -> bool {
        let mut state = self.state.lock();
        if state.ring.len() >= self.capacity {
            state.dropped += 1;
            warn!(
                "Event cache full ({} entries), dropping sink event {}",
                self.capacity, event
            );
            return false;
        }
        state.ring.push_back(event);
        self.cond.notify_one();
        true
    }

    /// Oldest notification, if any
    pub fn poll(&self) -> Option<u16> {
        self.state.lock().ring.pop_front()
    }

    /// Oldest notification, waiting up to `timeout` for one
    pub fn wait(&self, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.ring.is_empty() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.ring.pop_front()
    }

    /// Queued notifications
    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifications dropped so far
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Capacity
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
