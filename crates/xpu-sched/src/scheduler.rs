//! Two-slot frame scheduler
//!
//! Frames wait in one FIFO per accelerator. A pump admits the head frame
//! whenever a pipeline slot is free, so at most two frames are ever on the
//! remote cores. Completion arrives either as `FrameDone` from every
//! participating core or as a watchdog expiry; both race for the slot token
//! and the loser does nothing.
//!
//! ```text
//! submit ─► queue ─► pump ─► Sent ──FrameDone×N──┐
//!                      ▲            ──watchdog───┤─► Completing ─► worker ─► Empty
//!                      └───────────────────────────────────────────────────┘
//! ```
//!
//! The scheduler lock only guards the queue, the frame arena and the slot
//! rotation. Channel sends never happen under it.

use crate::completion::{CompletionJob, CompletionQueue};
use crate::config::{EngineMap, SchedConfig};
use crate::counters::DepCounters;
use crate::descriptor::{FrameDescriptor, SlotTable};
use crate::error::{Result, SchedError};
use crate::executor::{Executor, ExecutorShared};
use crate::frame::{
    BoundIo, CompletionCallback, CompletionStatus, FrameArena, FrameHandle, FrameId, FrameOutcome,
    FrameStats, FrameStatus, FrameWaiter, IoBindings,
};
use crate::graph::OperatorGraph;
use crate::outbox::Outbox;
use crate::program::{BufferBinder, ProgramEncoder, ProgramImage};
use crate::resolver::resolve;
use crate::slot::{SlotOwner, SlotState};
use crate::stats::{SchedStats, StatsSnapshot};
use crate::watchdog::Watchdog;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use xpu_proto::limits::TIKTOK_SLOTS;
use xpu_proto::{MsgType, Payload, SlotParam};

// ── Frames ───────────────────────────────────────────────────────────────────

/// Scheduler-side state of one frame
pub(crate) struct Frame {
    serial: u64,
    owner: Arc<ExecutorShared>,
    io: BoundIo,
    status: FrameStatus,
    slot: Option<usize>,
    seq: u8,
    capture: bool,
    /// Per model event source: credit already given
    credited: Vec<bool>,
    /// Operators reported paused and not yet resumed
    paused: Vec<u16>,
    /// Participating cores that have not reported `FrameDone`
    pending_cores: Vec<usize>,
    ops_completed: u32,
    submitted_at: Instant,
    sent_at: Option<Instant>,
    counters: Option<Arc<DepCounters>>,
    waiter: Arc<FrameWaiter>,
    callback: Option<CompletionCallback>,
}

impl Frame {
    fn is_live(&self) -> bool {
        matches!(self.status, FrameStatus::Queued | FrameStatus::Sent)
    }

    fn belongs_to(&self, owner: &Arc<ExecutorShared>) -> bool {
        Arc::ptr_eq(&self.owner, owner)
    }
}

struct SchedInner {
    frames: FrameArena<Frame>,
    queue: VecDeque<FrameId>,
    next_slot: usize,
    next_serial: u64,
    next_seq: u8,
}

enum Admission {
    Dispatch {
        frame: FrameId,
        slot: usize,
        seq: u8,
        capture: bool,
        cores: Vec<usize>,
    },
    Reject(FrameId),
    Idle,
}

/// One host message to one core, sent after the scheduler lock is dropped
struct Outgoing {
    core: usize,
    payload: Payload,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Scheduler for one accelerator instance
pub struct SchedulerContext {
    config: SchedConfig,
    engines: EngineMap,
    inner: Mutex<SchedInner>,
    slots: [SlotOwner; TIKTOK_SLOTS],
    descriptors: Arc<SlotTable>,
    is_sending: AtomicBool,
    closed: AtomicBool,
    outboxes: Vec<Outbox>,
    watchdog: Watchdog,
    completions: CompletionQueue,
    binder: Arc<dyn BufferBinder>,
    encoder: Arc<dyn ProgramEncoder>,
    stats: SchedStats,
    next_context: AtomicU32,
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("slots", &[self.slots[0].state(), self.slots[1].state()])
            .field("cores", &self.outboxes.len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl SchedulerContext {
    /// Scheduler sending to `outboxes` (one per core, in configuration order)
    pub fn new(
        config: SchedConfig,
        outboxes: Vec<Outbox>,
        descriptors: Arc<SlotTable>,
        binder: Arc<dyn BufferBinder>,
        encoder: Arc<dyn ProgramEncoder>,
    ) -> Self {
        let engines = config.engine_map();
        let watchdog = Watchdog::new(config.watchdog);
        Self {
            config,
            engines,
            inner: Mutex::new(SchedInner {
                frames: FrameArena::new(),
                queue: VecDeque::new(),
                next_slot: 0,
                next_serial: 0,
                next_seq: 0,
            }),
            slots: [SlotOwner::new(), SlotOwner::new()],
            descriptors,
            is_sending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outboxes,
            watchdog,
            completions: CompletionQueue::new(),
            binder,
            encoder,
            stats: SchedStats::default(),
            next_context: AtomicU32::new(1),
        }
    }

    /// Configuration in use
    pub const fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Buffer binder shared by all executors
    pub fn binder(&self) -> &Arc<dyn BufferBinder> {
        &self.binder
    }

    /// Slot watchdog
    pub const fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Deferred completion queue
    pub const fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    /// State of `slot`
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state()
    }

    /// Frames waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Frames known to the scheduler in any state
    pub fn live_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Frames currently on the remote cores
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s.state(), SlotState::Sent(_))).count()
    }

    /// Core driving each engine
    pub const fn engines(&self) -> &EngineMap {
        &self.engines
    }

    // ── Model load ──────────────────────────────────────────────────────────

    /// Resolve, encode and bind a graph
    ///
    /// # Errors
    ///
    /// Returns a graph error if resolution fails, an engine has no core, or
    /// an enabled-by edge crosses cores; a binding error if the program
    /// image cannot be mapped.
    pub fn load(self: &Arc<Self>, graph: &OperatorGraph) -> Result<Executor> {
        let model = resolve(graph)?;

        let mut cores = Vec::new();
        for ty in model.engines() {
            let core = self
                .engines
                .owner(ty)
                .ok_or_else(|| SchedError::invalid_graph(format!("no remote core drives {ty}")))?;
            if !cores.contains(&core) {
                cores.push(core);
            }
        }
        cores.sort_unstable();

        for meta in model.ops() {
            let Some(consumer) = meta.enable_consumer.and_then(|c| model.op(c)) else {
                continue;
            };
            if self.engines.owner(meta.ty) != self.engines.owner(consumer.ty) {
                return Err(SchedError::invalid_graph(format!(
                    "operator {} enables {} on another core",
                    meta.index, consumer.index
                )));
            }
        }

        let program =
            ProgramImage::build(graph, &model, self.encoder.as_ref(), self.binder.as_ref())?;
        let context = self.next_context.fetch_add(1, Ordering::Relaxed);
        info!(
            "Loaded model as context {}: {} operators on cores {:?}",
            context,
            model.len(),
            cores
        );
        let shared = Arc::new(ExecutorShared::new(
            context,
            Arc::new(model),
            Arc::new(program),
            cores,
            self.config.event_cache,
            Arc::clone(&self.binder),
        ));
        Ok(Executor::new(shared, Arc::clone(self)))
    }

    // ── Submission and admission ────────────────────────────────────────────

    pub(crate) fn submit(
        &self,
        owner: &Arc<ExecutorShared>,
        io: IoBindings,
        callback: Option<CompletionCallback>,
    ) -> Result<FrameHandle> {
        self.ensure_open()?;
        if !owner.is_alive() {
            return Err(SchedError::ContextTornDown {
                context: owner.context,
            });
        }

        let bound = self.bind_io(&io)?;
        let waiter = Arc::new(FrameWaiter::default());
        let id = {
            let mut inner = self.inner.lock();
            let serial = inner.next_serial;
            inner.next_serial += 1;
            let frame = Frame {
                serial,
                owner: Arc::clone(owner),
                io: bound,
                status: FrameStatus::Queued,
                slot: None,
                seq: 0,
                capture: self.config.capture_stats,
                credited: vec![false; owner.model.sources().len()],
                paused: Vec::new(),
                pending_cores: Vec::new(),
                ops_completed: 0,
                submitted_at: Instant::now(),
                sent_at: None,
                counters: None,
                waiter: Arc::clone(&waiter),
                callback,
            };
            let id = inner.frames.insert(frame)?;
            inner.queue.push_back(id);
            id
        };
        self.stats.on_submit();
        debug!("Frame {} queued for context {}", id, owner.context);

        self.pump();
        Ok(FrameHandle::new(id, waiter))
    }

    fn bind_io(&self, io: &IoBindings) -> Result<BoundIo> {
        let mut bound = BoundIo::default();
        for (i, handle) in io.handles().enumerate() {
            match self.binder.bind(handle) {
                Ok(addr) if i < io.inputs.len() => bound.inputs.push(addr),
                Ok(addr) => bound.outputs.push(addr),
                Err(e) => {
                    self.release_io(&bound);
                    return Err(e);
                }
            }
        }
        Ok(bound)
    }

    pub(crate) fn release_io(&self, io: &BoundIo) {
        for addr in io.addresses() {
            if let Err(e) = self.binder.release(addr) {
                warn!("Frame buffer release failed: {e}");
            }
        }
    }

    /// Admit queued frames into free slots
    ///
    /// Only one thread pumps at a time. A caller that finds the pump busy
    /// returns at once; the active pump re-checks after releasing the flag,
    /// so work queued meanwhile is not stranded.
    pub fn pump(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            if self
                .is_sending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                match self.admit_next() {
                    Admission::Dispatch {
                        frame,
                        slot,
                        seq,
                        capture,
                        cores,
                    } => {
                        for core in &cores {
                            let ready = Payload::frame_ready(slot as u8, seq, capture);
                            self.outboxes[*core].send(ready);
                        }
                        self.stats.on_send();
                        debug!("Frame {frame} sent in slot {slot} (seq {seq}) to cores {cores:?}");
                    }
                    Admission::Reject(frame) => {
                        debug!("Frame {frame} dropped: context torn down");
                        self.completions.push(CompletionJob {
                            frame,
                            slot: None,
                            status: CompletionStatus::Failed,
                        });
                    }
                    Admission::Idle => break,
                }
            }
            self.is_sending.store(false, Ordering::Release);
            if !self.can_admit() {
                return;
            }
        }
    }

    fn free_slot(&self, preferred: usize) -> Option<usize> {
        [preferred, preferred ^ 1]
            .into_iter()
            .find(|s| self.slots[*s].is_free())
    }

    fn can_admit(&self) -> bool {
        let inner = self.inner.lock();
        let Some(head) = inner.queue.front().and_then(|id| inner.frames.get(*id)) else {
            return !inner.queue.is_empty();
        };
        !head.owner.is_alive() || self.free_slot(inner.next_slot).is_some()
    }

    fn admit_next(&self) -> Admission {
        let mut inner = self.inner.lock();
        loop {
            let Some(&id) = inner.queue.front() else {
                return Admission::Idle;
            };
            let Some(frame) = inner.frames.get(id) else {
                inner.queue.pop_front();
                continue;
            };
            if !frame.owner.is_alive() {
                inner.queue.pop_front();
                if let Some(frame) = inner.frames.get_mut(id) {
                    frame.status = FrameStatus::Completing;
                }
                return Admission::Reject(id);
            }
            let Some(slot) = self.free_slot(inner.next_slot) else {
                return Admission::Idle;
            };
            if !self.slots[slot].claim(id) {
                return Admission::Idle;
            }
            inner.queue.pop_front();
            inner.next_slot = slot ^ 1;
            let seq = inner.next_seq;
            inner.next_seq = (seq + 1) & 0x0F;

            let Some(frame) = inner.frames.get_mut(id) else {
                error!("Frame {id} vanished during admission");
                return Admission::Idle;
            };
            let owner = Arc::clone(&frame.owner);
            let counters = owner.table_for_send(slot);
            for (binding, credited) in owner.model.sources().iter().zip(&frame.credited) {
                if *credited {
                    if let Err(e) = counters.decrement(usize::from(binding.op)) {
                        error!("Early credit for event {} failed: {e}", binding.event);
                    }
                }
            }
            frame.status = FrameStatus::Sent;
            frame.slot = Some(slot);
            frame.seq = seq;
            frame.sent_at = Some(Instant::now());
            frame.pending_cores.clone_from(&owner.cores);
            frame.counters = Some(Arc::clone(&counters));
            let capture = frame.capture;

            self.descriptors.publish(
                slot,
                Arc::new(FrameDescriptor {
                    seq,
                    capture,
                    model: Arc::clone(&owner.model),
                    counters,
                    program: Arc::clone(&owner.program),
                    pause: owner.pause_list(),
                    io_table: frame.io.address_table(),
                }),
            );
            self.watchdog.arm(slot, id);
            return Admission::Dispatch {
                frame: id,
                slot,
                seq,
                capture,
                cores: owner.cores.clone(),
            };
        }
    }

    // ── Inbound messages ────────────────────────────────────────────────────

    /// Handle one raw word received from core `core`
    pub fn handle_message(&self, core: usize, word: u32) {
        // Either failure still names a slot and sequence; charge that frame.
        #[allow(clippy::cast_possible_truncation)]
        let salvaged = SlotParam::salvage((word >> 8) as u8);
        let payload = match Payload::from_word(word) {
            Ok(p) => p,
            Err(e) => {
                self.violation(core, &format!("undecodable word {word:#010x}: {e}"));
                self.fail_current(salvaged.slot_index(), salvaged.seq);
                return;
            }
        };
        let param = match payload.slot_param() {
            Ok(p) => p,
            Err(e) => {
                self.violation(core, &format!("{:?} with bad param: {e}", payload.ty));
                self.fail_current(salvaged.slot_index(), salvaged.seq);
                return;
            }
        };
        let slot = param.slot_index();
        let op = payload.lparam;

        let mut inner = self.inner.lock();
        let Some(id) = self.occupant(&inner, slot, param.seq) else {
            drop(inner);
            self.stats.on_stale();
            trace!("Stale {:?} for slot {} seq {}", payload.ty, slot, param.seq);
            return;
        };
        let Some(frame) = inner.frames.get_mut(id) else {
            return;
        };
        let model = Arc::clone(&frame.owner.model);

        match payload.ty {
            MsgType::FrameDone => {
                let Some(pos) = frame.pending_cores.iter().position(|c| *c == core) else {
                    drop(inner);
                    self.violation(core, &format!("unexpected FrameDone for frame {id}"));
                    self.fail_frame(slot, id);
                    return;
                };
                frame.pending_cores.swap_remove(pos);
                frame.ops_completed += u32::from(op);
                if !frame.pending_cores.is_empty() {
                    return;
                }
                let complete = frame.ops_completed as usize == model.len();
                let reported = frame.ops_completed;
                drop(inner);
                if complete {
                    self.on_done(slot, id);
                } else {
                    self.violation(
                        core,
                        &format!("frame {id} reported {reported} of {} operators", model.len()),
                    );
                    self.fail_frame(slot, id);
                }
            }
            MsgType::OpDone => {
                if usize::from(op) >= model.len() {
                    drop(inner);
                    self.violation(core, &format!("OpDone for operator {op} out of range"));
                    self.fail_frame(slot, id);
                    return;
                }
                if !param.flag {
                    trace!("Operator {op} done in slot {slot}");
                    return;
                }
                if frame.owner.is_alive() {
                    debug!("Operator {op} paused in frame {id}");
                    frame.paused.push(op);
                } else {
                    drop(inner);
                    self.post_to_owner(&model, op, Payload::op_resume(slot as u8, param.seq, op));
                }
            }
            MsgType::DecRef => {
                drop(inner);
                let target = model.op(op).and_then(|m| self.engines.owner(m.ty));
                match target {
                    Some(owner) if owner != core => {
                        self.outboxes[owner].post(payload);
                        self.stats.on_relay();
                    }
                    _ => {
                        let msg = format!("DecRef for operator {op} cannot be relayed");
                        self.violation(core, &msg);
                        self.fail_frame(slot, id);
                    }
                }
            }
            MsgType::EventSinkDone => {
                let owner = Arc::clone(&frame.owner);
                drop(inner);
                if !model.is_sink_event(op) {
                    self.violation(core, &format!("EventSinkDone for unknown event {op}"));
                    self.fail_frame(slot, id);
                } else if !owner.events.push(op) {
                    self.stats.on_dropped_event();
                }
            }
            MsgType::FrameReady
            | MsgType::OpResume
            | MsgType::EventSourceCredit
            | MsgType::Abort => {
                drop(inner);
                self.violation(core, &format!("{:?} is not a core-to-host message", payload.ty));
                self.fail_frame(slot, id);
            }
        }
    }

    fn occupant(&self, inner: &SchedInner, slot: usize, seq: u8) -> Option<FrameId> {
        let SlotState::Sent(id) = self.slots[slot].state() else {
            return None;
        };
        inner.frames.get(id).filter(|f| f.seq == seq).map(|_| id)
    }

    fn violation(&self, core: usize, what: &str) {
        self.stats.on_protocol_violation();
        let name = self.outboxes.get(core).map_or("?", Outbox::name);
        warn!("Protocol violation from core {name}: {what}");
    }

    fn post_to_owner(&self, model: &crate::resolver::ResolvedModel, op: u16, payload: Payload) {
        if let Some(core) = model.op(op).and_then(|m| self.engines.owner(m.ty)) {
            self.outboxes[core].post(payload);
        }
    }

    fn send_all(&self, messages: Vec<Outgoing>) {
        for m in messages {
            self.outboxes[m.core].send(m.payload);
        }
    }

    // ── Completion triggers ─────────────────────────────────────────────────

    fn on_done(&self, slot: usize, id: FrameId) {
        self.watchdog.cancel(slot, id);
        if self.slots[slot].begin_completion(id) {
            debug!("Frame {id} done in slot {slot}");
            self.mark_completing(id);
            self.completions.push(CompletionJob {
                frame: id,
                slot: Some(slot),
                status: CompletionStatus::Success,
            });
        }
    }

    /// Watchdog expiry for `frame` in `slot`; a no-op if completion already won
    pub fn on_watchdog(&self, slot: usize, frame: FrameId) {
        if !self.slots[slot].begin_completion(frame) {
            debug!("Watchdog for frame {frame} lost the race in slot {slot}");
            return;
        }
        self.watchdog.cancel(slot, frame);
        warn!(
            "Frame {frame} timed out in slot {slot} after {:?}",
            self.watchdog.timeout()
        );
        self.mark_completing(frame);
        self.abort_slot(slot, frame);
        self.completions.push(CompletionJob {
            frame,
            slot: Some(slot),
            status: CompletionStatus::Timeout,
        });
    }

    fn fail_current(&self, slot: usize, seq: u8) {
        let id = {
            let inner = self.inner.lock();
            self.occupant(&inner, slot, seq)
        };
        if let Some(id) = id {
            self.fail_frame(slot, id);
        }
    }

    fn fail_frame(&self, slot: usize, id: FrameId) {
        self.watchdog.cancel(slot, id);
        if !self.slots[slot].begin_completion(id) {
            return;
        }
        warn!("Frame {id} in slot {slot} failed");
        self.mark_completing(id);
        self.abort_slot(slot, id);
        self.completions.push(CompletionJob {
            frame: id,
            slot: Some(slot),
            status: CompletionStatus::Failed,
        });
    }

    /// The slot token is won: the frame stops taking credits and resumes
    fn mark_completing(&self, id: FrameId) {
        if let Some(frame) = self.inner.lock().frames.get_mut(id) {
            frame.status = FrameStatus::Completing;
        }
    }

    fn abort_slot(&self, slot: usize, id: FrameId) {
        let target = {
            let inner = self.inner.lock();
            inner.frames.get(id).map(|f| (f.seq, f.owner.cores.clone()))
        };
        let Some((seq, cores)) = target else {
            return;
        };
        for core in cores {
            self.outboxes[core].post(Payload::abort(slot as u8, seq));
        }
    }

    /// Push parked host messages into their rings; returns `true` if any remain
    pub fn flush_outboxes(&self) -> bool {
        self.outboxes
            .iter()
            .fold(false, |pending, outbox| outbox.flush() || pending)
    }

    // ── Events ──────────────────────────────────────────────────────────────

    pub(crate) fn resume(&self, owner: &Arc<ExecutorShared>, op: u16) -> Result<()> {
        self.ensure_open()?;
        let target = {
            let mut inner = self.inner.lock();
            let oldest = inner
                .frames
                .iter()
                .filter(|(_, f)| {
                    f.belongs_to(owner) && f.status == FrameStatus::Sent && f.paused.contains(&op)
                })
                .min_by_key(|(_, f)| f.serial)
                .map(|(id, _)| id);
            oldest.and_then(|id| {
                let frame = inner.frames.get_mut(id)?;
                frame.paused.retain(|p| *p != op);
                Some((id, frame.slot?, frame.seq))
            })
        };
        let Some((id, slot, seq)) = target else {
            return Err(SchedError::invalid_state(format!(
                "operator {op} is not paused in any frame of context {}",
                owner.context
            )));
        };
        let core = owner
            .model
            .op(op)
            .and_then(|m| self.engines.owner(m.ty))
            .ok_or_else(|| SchedError::invalid_state(format!("operator {op} has no core")))?;
        debug!("Resuming operator {op} in frame {id}");
        self.outboxes[core].send(Payload::op_resume(slot as u8, seq, op));
        Ok(())
    }

    pub(crate) fn credit_source(&self, owner: &Arc<ExecutorShared>, event: u16) -> Result<()> {
        self.ensure_open()?;
        let index = owner.model.source_slot(event).ok_or_else(|| {
            SchedError::invalid_state(format!("event {event} has no source operator"))
        })?;
        let op = owner.model.sources()[index].op;

        let target = {
            let mut inner = self.inner.lock();
            let oldest = inner
                .frames
                .iter()
                .filter(|(_, f)| f.belongs_to(owner) && f.is_live() && !f.credited[index])
                .min_by_key(|(_, f)| f.serial)
                .map(|(id, _)| id);
            oldest.and_then(|id| {
                let frame = inner.frames.get_mut(id)?;
                frame.credited[index] = true;
                Some((id, frame.status, frame.slot, frame.seq))
            })
        };
        match target {
            None => Err(SchedError::invalid_state(format!(
                "no live frame of context {} is waiting for event {event}",
                owner.context
            ))),
            Some((id, FrameStatus::Sent, Some(slot), seq)) => {
                debug!("Crediting event {event} to running frame {id}");
                if let Some(core) = owner.model.op(op).and_then(|m| self.engines.owner(m.ty)) {
                    self.outboxes[core].send(Payload::event_source_credit(slot as u8, seq, event));
                }
                Ok(())
            }
            Some((id, _, _, _)) => {
                debug!("Recorded event {event} credit for queued frame {id}");
                Ok(())
            }
        }
    }

    pub(crate) fn teardown(&self, owner: &Arc<ExecutorShared>) {
        if !owner.kill() || self.is_closed() {
            return;
        }
        let messages = {
            let mut inner = self.inner.lock();
            let mut running: Vec<FrameId> = inner
                .frames
                .iter()
                .filter(|(_, f)| f.belongs_to(owner) && f.status == FrameStatus::Sent)
                .map(|(id, _)| id)
                .collect();
            running.sort_by_key(|id| inner.frames.get(*id).map_or(u64::MAX, |f| f.serial));

            let mut messages = Vec::new();
            for id in running {
                let Some(frame) = inner.frames.get_mut(id) else {
                    continue;
                };
                let Some(slot) = frame.slot else {
                    continue;
                };
                #[allow(clippy::cast_possible_truncation)]
                let slot = slot as u8;
                for (i, binding) in owner.model.sources().iter().enumerate() {
                    if std::mem::replace(&mut frame.credited[i], true) {
                        continue;
                    }
                    let owner_core =
                        owner.model.op(binding.op).and_then(|m| self.engines.owner(m.ty));
                    if let Some(core) = owner_core {
                        messages.push(Outgoing {
                            core,
                            payload: Payload::event_source_credit(slot, frame.seq, binding.event),
                        });
                    }
                }
                for op in frame.paused.drain(..) {
                    if let Some(core) = owner.model.op(op).and_then(|m| self.engines.owner(m.ty)) {
                        messages.push(Outgoing {
                            core,
                            payload: Payload::op_resume(slot, frame.seq, op),
                        });
                    }
                }
            }
            messages
        };
        info!(
            "Context {} torn down, {} synthetic credits/resumes",
            owner.context,
            messages.len()
        );
        self.send_all(messages);
        self.pump();
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Finish a frame: release buffers, publish the outcome, free the slot
    pub fn complete(&self, job: CompletionJob) {
        let now = Instant::now();
        let taken = {
            let mut inner = self.inner.lock();
            inner.frames.get_mut(job.frame).map(|frame| {
                frame.status = FrameStatus::Done;
                (
                    std::mem::take(&mut frame.io),
                    frame.callback.take(),
                    Arc::clone(&frame.waiter),
                    frame.counters.take(),
                    frame.capture,
                    frame.owner.cores.len(),
                    frame.ops_completed,
                    frame.submitted_at,
                    frame.sent_at,
                )
            })
        };
        let Some((
            io,
            callback,
            waiter,
            counters,
            capture,
            cores,
            ops_completed,
            submitted_at,
            sent_at,
        )) = taken
        else {
            error!("Completion for unknown frame {}", job.frame);
            return;
        };

        self.release_io(&io);
        let stats = FrameStats {
            queued: sent_at.map_or(now - submitted_at, |s| s - submitted_at),
            execution: sent_at.map_or_else(Default::default, |s| now - s),
            total: now - submitted_at,
            cores: if sent_at.is_some() { cores } else { 0 },
            ops_completed,
            counter_residue: counters.as_ref().filter(|_| capture).map(|c| c.residue()),
        };
        drop(counters);
        let outcome = FrameOutcome {
            status: job.status,
            stats,
        };
        match job.status {
            CompletionStatus::Success => self.stats.on_complete(),
            CompletionStatus::Timeout => self.stats.on_timeout(),
            CompletionStatus::Failed => self.stats.on_failure(),
        }
        waiter.resolve(outcome.clone());
        if let Some(callback) = callback {
            callback(job.frame, &outcome);
        }

        if let Some(slot) = job.slot {
            self.descriptors.clear(slot);
            if !self.slots[slot].release(job.frame) {
                error!("Slot {slot} was not held by completing frame {}", job.frame);
            }
        }
        self.inner.lock().frames.remove(job.frame);
        debug!(
            "Frame {} finished: {:?} in {:?}",
            job.frame, job.status, outcome.stats.total
        );
        self.pump();
    }

    /// Stop admitting frames
    ///
    /// Later submissions fail with `InvalidState` and pumping becomes a
    /// no-op. Frames already on the cores keep running.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Scheduler closed to new frames");
        }
        self.watchdog.stop();
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SchedError::invalid_state("scheduler is shut down"));
        }
        Ok(())
    }

    /// Fail every frame that has not finished
    ///
    /// Called once the remote cores are gone, so nothing is sent. Waiters
    /// and callbacks run on the calling thread.
    pub fn fail_outstanding(&self) {
        let outstanding: Vec<(FrameId, Option<usize>)> = {
            let mut inner = self.inner.lock();
            inner.queue.clear();
            inner
                .frames
                .iter()
                .filter(|(_, f)| f.is_live())
                .map(|(id, f)| (id, f.slot))
                .collect()
        };
        if !outstanding.is_empty() {
            warn!("Failing {} outstanding frames at shutdown", outstanding.len());
        }
        for (frame, slot) in outstanding {
            let claimed = match slot {
                Some(s) => self.slots[s].begin_completion(frame),
                None => true,
            };
            if claimed {
                self.completions.push(CompletionJob {
                    frame,
                    slot,
                    status: CompletionStatus::Failed,
                });
            }
        }
        while let Some(job) = self.completions.pop() {
            self.complete(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel_pair, Receiver};
    use crate::doorbell::Doorbell;
    use crate::graph::{EventRole, Operator};
    use crate::program::{EnvelopeEncoder, SoftwareBinder};
    use xpu_proto::EdgeKind;

    /// Scheduler with no worker threads; the returned receivers are the
    /// cores' inbound rings
    fn bare_scheduler() -> (Arc<SchedulerContext>, Vec<Receiver>) {
        let config = SchedConfig::default();
        let host_bell = Arc::new(Doorbell::new());
        let mut outboxes = Vec::new();
        let mut inboxes = Vec::new();
        for spec in &config.cores {
            let (host, core) =
                channel_pair(64, 64, Arc::clone(&host_bell), Arc::new(Doorbell::new())).unwrap();
            let (tx, _) = host.split();
            let (_, rx) = core.split();
            outboxes.push(Outbox::new(spec.name.clone(), tx, Arc::clone(&host_bell)));
            inboxes.push(rx);
        }
        let sched = SchedulerContext::new(
            config,
            outboxes,
            Arc::new(SlotTable::new()),
            Arc::new(SoftwareBinder::new()),
            Arc::new(EnvelopeEncoder),
        );
        (Arc::new(sched), inboxes)
    }

    fn source_graph() -> OperatorGraph {
        [
            Operator::new(0, xpu_proto::OpType::Dma)
                .consumer(1, EdgeKind::CompletedBy)
                .event(EventRole::Source(0)),
            Operator::new(1, xpu_proto::OpType::Pdp),
        ]
        .into_iter()
        .collect()
    }

    fn io(n: u64) -> IoBindings {
        IoBindings::single(
            crate::program::TensorHandle::new(2 * n, 64),
            crate::program::TensorHandle::new(2 * n + 1, 64),
        )
    }

    fn drain(rx: &mut Receiver) -> Vec<Payload> {
        std::iter::from_fn(|| rx.receive().unwrap()).collect()
    }

    fn run_completions(sched: &SchedulerContext) {
        while let Some(job) = sched.completions().pop() {
            sched.complete(job);
        }
    }

    #[test]
    fn credit_after_timeout_goes_to_next_frame() {
        let (sched, mut inboxes) = bare_scheduler();
        let exec = sched.load(&source_graph()).unwrap();
        let f1 = exec.submit(io(1)).unwrap();
        let f2 = exec.submit(io(2)).unwrap();
        assert_eq!(sched.slot_state(0), SlotState::Sent(f1.id()));
        assert_eq!(sched.slot_state(1), SlotState::Sent(f2.id()));
        drain(&mut inboxes[0]);

        // the completion worker has not run yet
        sched.on_watchdog(0, f1.id());
        exec.push_event_source_credit(0).unwrap();

        let credits: Vec<Payload> = drain(&mut inboxes[0])
            .into_iter()
            .filter(|p| p.ty == MsgType::EventSourceCredit)
            .collect();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].slot_param().unwrap().slot_index(), 1);

        run_completions(&sched);
        assert_eq!(f1.try_outcome().unwrap().status, CompletionStatus::Timeout);
        assert!(matches!(
            exec.push_event_source_credit(0),
            Err(SchedError::InvalidState { .. })
        ));
    }

    #[test]
    fn completing_frame_is_skipped_by_resume_and_teardown() {
        let (sched, mut inboxes) = bare_scheduler();
        let exec = sched.load(&source_graph()).unwrap();
        exec.set_pause_list(&[0]).unwrap();
        let f1 = exec.submit(io(1)).unwrap();
        let seq = sched.inner.lock().frames.get(f1.id()).unwrap().seq;
        sched.handle_message(0, Payload::op_done(0, seq, true, 0).to_word());

        sched.on_watchdog(0, f1.id());
        assert!(matches!(exec.resume(0), Err(SchedError::InvalidState { .. })));

        drain(&mut inboxes[0]);
        exec.teardown();
        let sent = drain(&mut inboxes[0]);
        assert!(sent
            .iter()
            .all(|p| !matches!(p.ty, MsgType::EventSourceCredit | MsgType::OpResume)));
        run_completions(&sched);
        assert_eq!(f1.try_outcome().unwrap().status, CompletionStatus::Timeout);
    }

    #[test]
    fn reserved_param_bits_fail_the_named_frame() {
        let (sched, _inboxes) = bare_scheduler();
        let exec = sched.load(&source_graph()).unwrap();
        let f1 = exec.submit(io(1)).unwrap();
        let f2 = exec.submit(io(2)).unwrap();
        let seq = sched.inner.lock().frames.get(f2.id()).unwrap().seq;

        let word = Payload::frame_done(1, seq, false, 2).to_word() | (0x04 << 8);
        sched.handle_message(0, word);
        assert_eq!(sched.stats().protocol_violations, 1);

        run_completions(&sched);
        assert_eq!(f2.try_outcome().unwrap().status, CompletionStatus::Failed);
        assert!(f1.try_outcome().is_none());
        assert_eq!(sched.slot_state(0), SlotState::Sent(f1.id()));
    }
}
