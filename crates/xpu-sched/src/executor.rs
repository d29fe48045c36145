//! Loaded models
//!
//! An [`Executor`] is one user context: a resolved model, its bound program
//! image and the per-slot counter tables its frames run against. Dropping
//! it tears the context down; frames still in flight keep the shared state
//! alive until the completion path has finished with them.

use crate::counters::DepCounters;
use crate::error::Result;
use crate::events::{EventCache, PauseList};
use crate::frame::{FrameHandle, FrameId, FrameOutcome, IoBindings};
use crate::program::{BufferBinder, ProgramImage};
use crate::resolver::ResolvedModel;
use crate::scheduler::SchedulerContext;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use xpu_proto::limits::TIKTOK_SLOTS;

/// State shared between an executor and its frames
pub(crate) struct ExecutorShared {
    pub(crate) context: u32,
    pub(crate) model: Arc<ResolvedModel>,
    pub(crate) program: Arc<ProgramImage>,
    /// Remote cores that drive at least one engine of the model
    pub(crate) cores: Vec<usize>,
    pub(crate) events: EventCache,
    tables: [Mutex<Option<Arc<DepCounters>>>; TIKTOK_SLOTS],
    pause: RwLock<PauseList>,
    alive: AtomicBool,
    binder: Arc<dyn BufferBinder>,
}

impl ExecutorShared {
    pub(crate) fn new(
        context: u32,
        model: Arc<ResolvedModel>,
        program: Arc<ProgramImage>,
        cores: Vec<usize>,
        event_cache: usize,
        binder: Arc<dyn BufferBinder>,
    ) -> Self {
        Self {
            context,
            model,
            program,
            cores,
            events: EventCache::new(event_cache),
            tables: [Mutex::new(None), Mutex::new(None)],
            pause: RwLock::new(PauseList::default()),
            alive: AtomicBool::new(true),
            binder,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the context dead; `true` for the call that did it
    pub(crate) fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn pause_list(&self) -> PauseList {
        self.pause.read().clone()
    }

    /// Counter table for a frame about to be sent in `slot`, reset to the
    /// model's template
    ///
    /// The previous table is reused only when nothing else holds it. A core
    /// that was aborted mid-frame may still hold the old one, so it gets a
    /// fresh table instead of sharing.
    pub(crate) fn table_for_send(&self, slot: usize) -> Arc<DepCounters> {
        let template = self.model.template();
        let mut entry = self.tables[slot].lock();
        if let Some(table) = entry.as_mut() {
            if Arc::get_mut(table).is_some() {
                table.reset_from(template);
                return Arc::clone(table);
            }
            debug!(
                "Context {} slot {}: counter table still referenced, allocating",
                self.context, slot
            );
        }
        let table = Arc::new(template.clone());
        *entry = Some(Arc::clone(&table));
        table
    }
}

impl Drop for ExecutorShared {
    fn drop(&mut self) {
        self.program.release(self.binder.as_ref());
        debug!("Context {} released", self.context);
    }
}

/// Handle to a loaded model
///
/// Obtained from [`SchedulerContext::load`] or `Cluster::load`.
pub struct Executor {
    shared: Arc<ExecutorShared>,
    sched: Arc<SchedulerContext>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("context", &self.shared.context)
            .field("operators", &self.shared.model.len())
            .field("cores", &self.shared.cores)
            .field("alive", &self.shared.is_alive())
            .finish()
    }
}

impl Executor {
    pub(crate) const fn new(shared: Arc<ExecutorShared>, sched: Arc<SchedulerContext>) -> Self {
        Self { shared, sched }
    }

    /// Context identifier
    pub fn context_id(&self) -> u32 {
        self.shared.context
    }

    /// Resolved model
    pub fn model(&self) -> &ResolvedModel {
        &self.shared.model
    }

    /// Remote cores this model runs on
    pub fn cores(&self) -> &[usize] {
        &self.shared.cores
    }

    /// Whether [`teardown`](Self::teardown) has not run yet
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Queue a frame
    ///
    /// # Errors
    ///
    /// Returns `ContextTornDown` after teardown, `InvalidState` after the
    /// scheduler shut down, or a binding error if a buffer cannot be mapped.
    pub fn submit(&self, io: IoBindings) -> Result<FrameHandle> {
        self.sched.submit(&self.shared, io, None)
    }

    /// Queue a frame and run `callback` on the completion worker when it ends
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub fn submit_with<F>(&self, io: IoBindings, callback: F) -> Result<FrameHandle>
    where
        F: FnOnce(FrameId, &FrameOutcome) + Send + 'static,
    {
        self.sched.submit(&self.shared, io, Some(Box::new(callback)))
    }

    /// Replace the pause-on-completion list
    ///
    /// Takes effect for frames sent afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error for more than 32 operators or an unknown index.
    pub fn set_pause_list(&self, ops: &[u16]) -> Result<()> {
        let list = PauseList::new(ops, self.shared.model.len())?;
        debug!("Context {} pause list: {:?}", self.shared.context, list.ops());
        *self.shared.pause.write() = list;
        Ok(())
    }

    /// Resume `op` in the oldest in-flight frame that reported it paused
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no frame has `op` paused.
    pub fn resume(&self, op: u16) -> Result<()> {
        self.sched.resume(&self.shared, op)
    }

    /// Credit event source `event` for the oldest live frame lacking it
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the model has no such source or every live
    /// frame is already credited.
    pub fn push_event_source_credit(&self, event: u16) -> Result<()> {
        self.sched.credit_source(&self.shared, event)
    }

    /// Oldest event sink notification, if any
    pub fn poll_event_sink(&self) -> Option<u16> {
        self.shared.events.poll()
    }

    /// Oldest event sink notification, waiting up to `timeout`
    pub fn wait_event_sink(&self, timeout: Duration) -> Option<u16> {
        self.shared.events.wait(timeout)
    }

    /// Sink notifications dropped because the cache was full
    pub fn dropped_events(&self) -> u64 {
        self.shared.events.dropped()
    }

    /// Mark the context dead and release whatever its frames wait on
    ///
    /// In-flight frames receive one synthetic credit per uncredited event
    /// source and a resume for every paused operator, so they can drain.
    /// Queued frames fail without being sent. Idempotent.
    pub fn teardown(&self) {
        if self.shared.is_alive() {
            info!("Tearing down context {}", self.shared.context);
        }
        self.sched.teardown(&self.shared);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.teardown();
    }
}
