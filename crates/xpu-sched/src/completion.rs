//! Deferred completion
//!
//! The receive thread and the watchdog only decide *that* a frame is
//! finished. Everything that may block or call user code runs here, on a
//! dedicated worker fed through a lock-free injector queue.

use crate::doorbell::Doorbell;
use crate::frame::{CompletionStatus, FrameId};
use crate::scheduler::SchedulerContext;
use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// One frame to finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionJob {
    /// Frame to finish
    pub frame: FrameId,
    /// Slot the frame occupied; `None` if it never left the queue
    pub slot: Option<usize>,
    /// Terminal status
    pub status: CompletionStatus,
}

/// Job queue plus a doorbell for the worker
#[derive(Debug, Default)]
pub struct CompletionQueue {
    jobs: Injector<CompletionJob>,
    bell: Doorbell,
}

impl CompletionQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job and wake the worker
    pub fn push(&self, job: CompletionJob) {
        self.jobs.push(job);
        self.bell.ring();
    }

    /// Next job, if any
    pub fn pop(&self) -> Option<CompletionJob> {
        loop {
            match self.jobs.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Whether no job is queued
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait for a push or `timeout`
    pub fn wait(&self, timeout: Duration) -> bool {
        self.bell.wait_timeout(timeout)
    }

    /// Wake the worker without a job
    pub fn wake(&self) {
        self.bell.ring();
    }
}

/// Worker loop: finish queued frames until `stop` is set and the queue is empty
pub fn run_completion_worker(sched: &SchedulerContext, stop: &AtomicBool) {
    debug!("Completion worker started");
    loop {
        while let Some(job) = sched.completions().pop() {
            sched.complete(job);
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        sched.completions().wait(Duration::from_millis(50));
    }
    debug!("Completion worker stopped");
}
