//! Software remote core
//!
//! One thread per remote execution context. It drains its inbound ring,
//! drives the frames in both slots and reports back over its outbound ring.
//! Sends to the host may busy-wait; the host receive thread never does, so
//! the host always drains.

use super::run::SlotRun;
use crate::channel::{Endpoint, Receiver, Sender};
use crate::config::{CoreSpec, EngineMap};
use crate::descriptor::SlotTable;
use crate::program::EnvelopeEncoder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use xpu_proto::limits::TIKTOK_SLOTS;
use xpu_proto::{MsgType, Payload};

const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Firmware stand-in for one remote core
#[derive(Debug)]
pub struct SoftwareCore {
    index: usize,
    spec: CoreSpec,
    engines: EngineMap,
    tx: Sender,
    rx: Receiver,
    descriptors: Arc<SlotTable>,
    runs: [Option<SlotRun>; TIKTOK_SLOTS],
    out: Vec<Payload>,
}

impl SoftwareCore {
    /// Core number `index` talking over `endpoint`
    pub fn new(
        index: usize,
        spec: CoreSpec,
        engines: EngineMap,
        endpoint: Endpoint,
        descriptors: Arc<SlotTable>,
    ) -> Self {
        let (tx, rx) = endpoint.split();
        Self {
            index,
            spec,
            engines,
            tx,
            rx,
            descriptors,
            runs: [None, None],
            out: Vec::new(),
        }
    }

    /// Core name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Serve messages until `stop` is set
    pub fn run(mut self, stop: &AtomicBool) {
        info!(
            "Remote core {} up, engines {:?}, faults {:?}",
            self.spec.name, self.spec.engines, self.spec.faults
        );
        let bell = Arc::clone(self.rx.doorbell());
        while !stop.load(Ordering::Acquire) {
            let mut idle = true;
            loop {
                match self.rx.receive() {
                    Ok(Some(payload)) => {
                        idle = false;
                        self.handle(payload);
                    }
                    Ok(None) => break,
                    Err(e) => warn!("Core {}: dropping message: {e}", self.spec.name),
                }
            }
            if idle {
                bell.wait_timeout(IDLE_WAIT);
            }
        }
        debug!(
            "Remote core {} stopped ({} saturated sends)",
            self.spec.name,
            self.tx.saturation_count()
        );
    }

    /// Handle one host message and send whatever it produced
    pub fn handle(&mut self, payload: Payload) {
        let param = match payload.slot_param() {
            Ok(p) => p,
            Err(e) => {
                warn!("Core {}: {:?} with bad param: {e}", self.spec.name, payload.ty);
                return;
            }
        };
        let (slot, seq, op) = (param.slot_index(), param.seq, payload.lparam);
        trace!("Core {} <- {:?} slot {} seq {} arg {}", self.spec.name, payload.ty, slot, seq, op);

        match payload.ty {
            MsgType::FrameReady => self.frame_ready(slot, seq),
            MsgType::DecRef => self.credit(slot, seq, op),
            MsgType::EventSourceCredit => self.source_credit(slot, seq, op),
            MsgType::OpResume => {
                let resumed = match self.runs[slot].as_mut().filter(|r| r.seq() == seq) {
                    Some(run) => run.resume(op, &mut self.out),
                    None => false,
                };
                if !resumed {
                    warn!(
                        "Core {}: resume for operator {} not paused in slot {} seq {}",
                        self.spec.name, op, slot, seq
                    );
                }
            }
            MsgType::Abort => {
                if self.runs[slot].as_ref().is_some_and(|r| r.seq() == seq) {
                    debug!("Core {}: slot {} seq {} aborted", self.spec.name, slot, seq);
                    self.runs[slot] = None;
                }
            }
            MsgType::FrameDone | MsgType::OpDone | MsgType::EventSinkDone => {
                warn!("Core {}: {:?} is host-bound", self.spec.name, payload.ty);
            }
        }
        self.flush();
        // Let go of finished frames so the host can reuse their counter tables.
        for run in &mut self.runs {
            if run.as_ref().is_some_and(SlotRun::is_reported) {
                *run = None;
            }
        }
    }

    fn frame_ready(&mut self, slot: usize, seq: u8) {
        let Some(desc) = self.descriptors.matching(slot, seq) else {
            warn!(
                "Core {}: FrameReady without descriptor for slot {} seq {}",
                self.spec.name, slot, seq
            );
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let slot_u8 = slot as u8;
        if self.spec.faults.corrupt_op {
            let bogus = u16::try_from(desc.model.len() + 7).unwrap_or(u16::MAX);
            self.out.push(Payload::op_done(slot_u8, seq, false, bogus));
            self.runs[slot] = None;
            return;
        }

        let run = SlotRun::new(slot_u8, self.index, self.engines, desc);
        for ty in run.owned() {
            let expected = run.descriptor().model.sequence(*ty);
            match EnvelopeEncoder::headers(run.descriptor().program.segment(*ty)) {
                Ok(headers) if headers.iter().map(|h| h.index).eq(expected.iter().copied()) => {}
                Ok(headers) => {
                    error!(
                        "Core {}: {} program has {} records, expected {}",
                        self.spec.name,
                        ty,
                        headers.len(),
                        expected.len()
                    );
                    return;
                }
                Err(e) => {
                    error!("Core {}: unreadable {} program: {e}", self.spec.name, ty);
                    return;
                }
            }
        }
        debug!("Core {}: frame seq {} started in slot {}", self.spec.name, seq, slot);
        let run = self.runs[slot].insert(run);
        run.advance(&mut self.out);
    }

    fn credit(&mut self, slot: usize, seq: u8, op: u16) {
        if let Some(run) = self.runs[slot].as_mut().filter(|r| r.seq() == seq) {
            run.credit(op, &mut self.out);
            return;
        }
        // Credits may overtake FrameReady; apply them to the published table.
        let Some(desc) = self.descriptors.matching(slot, seq) else {
            trace!("Core {}: stale credit for slot {} seq {}", self.spec.name, slot, seq);
            return;
        };
        let local = desc
            .model
            .op(op)
            .is_some_and(|m| self.engines.owner(m.ty) == Some(self.index));
        if !local {
            error!("Core {}: credit for operator {} it does not own", self.spec.name, op);
            return;
        }
        if let Err(e) = desc.counters.decrement(usize::from(op)) {
            error!("Core {}: early credit for operator {} failed: {e}", self.spec.name, op);
        }
    }

    fn source_credit(&mut self, slot: usize, seq: u8, event: u16) {
        let desc = match self.runs[slot].as_ref().filter(|r| r.seq() == seq) {
            Some(run) => Some(Arc::clone(run.descriptor())),
            None => self.descriptors.matching(slot, seq),
        };
        let Some(desc) = desc else {
            trace!("Core {}: stale source credit for slot {} seq {}", self.spec.name, slot, seq);
            return;
        };
        match desc.model.source_slot(event) {
            Some(i) => self.credit(slot, seq, desc.model.sources()[i].op),
            None => warn!("Core {}: credit for unknown event source {}", self.spec.name, event),
        }
    }

    fn flush(&mut self) {
        for payload in self.out.drain(..) {
            if self.spec.faults.hang && payload.ty == MsgType::FrameDone {
                debug!("Core {}: withholding FrameDone", self.spec.name);
                continue;
            }
            self.tx.send(payload);
        }
    }
}
