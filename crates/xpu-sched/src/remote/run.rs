//! Execution state of one frame on one remote core
//!
//! Each owned engine walks its operator sequence in compiled order. The head
//! operator is programmed (its own credit is taken) once its enabler, if
//! any, has propagated; it runs when its counter reaches zero. Finishing an
//! operator decrements local consumers directly and asks the host to relay
//! the decrement for consumers on other cores.
//!
//! The run only produces messages; the owning core decides how to send them.

use crate::config::EngineMap;
use crate::descriptor::FrameDescriptor;
use std::sync::Arc;
use tracing::{error, trace};
use xpu_proto::op::OP_TYPE_COUNT;
use xpu_proto::{OpType, Payload};

/// One frame in one slot, as seen by one core
#[derive(Debug)]
pub struct SlotRun {
    slot: u8,
    seq: u8,
    core: usize,
    engines: EngineMap,
    desc: Arc<FrameDescriptor>,
    owned: Vec<OpType>,
    cursor: [usize; OP_TYPE_COUNT],
    programmed: Vec<bool>,
    propagated: Vec<bool>,
    paused: Vec<u16>,
    executed: usize,
    local_ops: usize,
    stalled: bool,
    reported: bool,
}

impl SlotRun {
    /// Start a frame on core `core`
    pub fn new(slot: u8, core: usize, engines: EngineMap, desc: Arc<FrameDescriptor>) -> Self {
        let owned: Vec<OpType> = desc
            .model
            .engines()
            .filter(|ty| engines.owner(*ty) == Some(core))
            .collect();
        let local_ops = owned.iter().map(|ty| desc.model.sequence(*ty).len()).sum();
        let n = desc.model.len();
        Self {
            slot,
            seq: desc.seq,
            core,
            engines,
            owned,
            cursor: [0; OP_TYPE_COUNT],
            programmed: vec![false; n],
            propagated: vec![false; n],
            paused: Vec::new(),
            executed: 0,
            local_ops,
            stalled: false,
            reported: false,
            desc,
        }
    }

    /// Sequence tag of the frame
    pub const fn seq(&self) -> u8 {
        self.seq
    }

    /// Engines this core drives for the frame
    pub fn owned(&self) -> &[OpType] {
        &self.owned
    }

    /// Descriptor the run executes
    pub const fn descriptor(&self) -> &Arc<FrameDescriptor> {
        &self.desc
    }

    /// Operators executed so far
    pub const fn executed(&self) -> usize {
        self.executed
    }

    /// Whether `FrameDone` has been produced
    pub const fn is_reported(&self) -> bool {
        self.reported
    }

    /// Whether a counter fault stopped the run
    pub const fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Whether `op` runs on this core
    pub fn is_local(&self, op: u16) -> bool {
        self.desc
            .model
            .op(op)
            .is_some_and(|m| self.engines.owner(m.ty) == Some(self.core))
    }

    fn decrement(&mut self, op: u16) -> bool {
        match self.desc.counters.decrement(usize::from(op)) {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Slot {} seq {}: counter fault on operator {}: {e}; stalling",
                    self.slot, self.seq, op
                );
                self.stalled = true;
                false
            }
        }
    }

    /// Apply a credit from outside this core (relayed completion or event)
    pub fn credit(&mut self, op: u16, out: &mut Vec<Payload>) {
        if self.stalled {
            return;
        }
        if !self.is_local(op) {
            error!("Slot {}: credit for operator {} owned elsewhere", self.slot, op);
            return;
        }
        if self.decrement(op) {
            self.advance(out);
        }
    }

    /// Release a paused operator; `false` if it was not paused
    pub fn resume(&mut self, op: u16, out: &mut Vec<Payload>) -> bool {
        let Some(pos) = self.paused.iter().position(|p| *p == op) else {
            return false;
        };
        self.paused.swap_remove(pos);
        trace!("Slot {}: operator {} resumed", self.slot, op);
        if self.propagate(op, out) {
            self.advance(out);
        }
        true
    }

    /// Run everything that is runnable
    pub fn advance(&mut self, out: &mut Vec<Payload>) {
        if self.stalled || self.reported {
            return;
        }
        let desc = Arc::clone(&self.desc);
        loop {
            let mut progressed = false;
            for i in 0..self.owned.len() {
                let ty = self.owned[i];
                let Some(&op) = desc.model.sequence(ty).get(self.cursor[ty.index()]) else {
                    continue;
                };
                let Some(meta) = desc.model.op(op) else {
                    continue;
                };
                let index = usize::from(op);
                if !self.programmed[index] {
                    if meta.enabled_by.is_some_and(|e| !self.propagated[usize::from(e)]) {
                        continue;
                    }
                    if !self.decrement(op) {
                        return;
                    }
                    self.programmed[index] = true;
                    progressed = true;
                }
                if desc.counters.get(index) != 0 {
                    continue;
                }

                self.cursor[ty.index()] += 1;
                self.executed += 1;
                progressed = true;
                if desc.pause.contains(op) {
                    trace!("Slot {}: operator {} paused", self.slot, op);
                    self.paused.push(op);
                    out.push(Payload::op_done(self.slot, self.seq, true, op));
                } else if !self.propagate(op, out) {
                    return;
                }
            }
            if !progressed {
                break;
            }
        }

        if self.executed == self.local_ops && self.paused.is_empty() {
            self.reported = true;
            let completed = u16::try_from(self.executed).unwrap_or(u16::MAX);
            out.push(Payload::frame_done(self.slot, self.seq, desc.capture, completed));
        }
    }

    fn propagate(&mut self, op: u16, out: &mut Vec<Payload>) -> bool {
        let desc = Arc::clone(&self.desc);
        let Some(meta) = desc.model.op(op) else {
            return true;
        };
        self.propagated[usize::from(op)] = true;
        if desc.capture {
            out.push(Payload::op_done(self.slot, self.seq, false, op));
        }
        for consumer in meta.completion_consumers() {
            if self.is_local(consumer) {
                if !self.decrement(consumer) {
                    return false;
                }
            } else {
                out.push(Payload::dec_ref(self.slot, self.seq, consumer));
            }
        }
        if let Some(event) = meta.sink_event() {
            out.push(Payload::event_sink_done(self.slot, self.seq, event));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_cores;
    use crate::events::PauseList;
    use crate::graph::{EventRole, Operator, OperatorGraph};
    use crate::program::{EnvelopeEncoder, ProgramImage, SoftwareBinder};
    use crate::resolver::resolve;
    use bytes::Bytes;
    use xpu_proto::{EdgeKind, MsgType};

    fn descriptor(graph: &OperatorGraph, pause: &[u16]) -> Arc<FrameDescriptor> {
        let model = resolve(graph).unwrap();
        let program =
            ProgramImage::build(graph, &model, &EnvelopeEncoder, &SoftwareBinder::new()).unwrap();
        let pause = PauseList::new(pause, model.len()).unwrap();
        Arc::new(FrameDescriptor {
            seq: 3,
            capture: false,
            counters: Arc::new(model.template().clone()),
            model: Arc::new(model),
            program: Arc::new(program),
            pause,
            io_table: Bytes::new(),
        })
    }

    fn engines() -> EngineMap {
        EngineMap::from_cores(&default_cores())
    }

    fn types(out: &[Payload]) -> Vec<MsgType> {
        out.iter().map(|p| p.ty).collect()
    }

    #[test]
    fn local_chain_runs_to_done() {
        let desc = descriptor(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma]), &[]);
        let mut run = SlotRun::new(1, 0, engines(), Arc::clone(&desc));
        let mut out = Vec::new();
        run.advance(&mut out);

        assert_eq!(types(&out), vec![MsgType::FrameDone]);
        assert_eq!(out[0].lparam, 3);
        let param = out[0].slot_param().unwrap();
        assert_eq!((param.slot, param.seq), (1, 3));
        assert!(run.is_reported());
        assert_eq!(desc.counters.residue(), 0);
    }

    #[test]
    fn remote_consumer_goes_through_host() {
        let graph = OperatorGraph::chain(&[OpType::Dma, OpType::Dsp, OpType::Dma]);
        let desc = descriptor(&graph, &[]);
        let mut main = SlotRun::new(0, 0, engines(), Arc::clone(&desc));
        let mut dsp = SlotRun::new(0, 1, engines(), Arc::clone(&desc));

        let mut out = Vec::new();
        main.advance(&mut out);
        assert_eq!(out, vec![Payload::dec_ref(0, 3, 1)]);

        let mut dsp_out = Vec::new();
        dsp.advance(&mut dsp_out);
        assert!(dsp_out.is_empty());
        dsp.credit(1, &mut dsp_out);
        assert_eq!(
            dsp_out,
            vec![Payload::dec_ref(0, 3, 2), Payload::frame_done(0, 3, false, 1)]
        );

        out.clear();
        main.credit(2, &mut out);
        assert_eq!(out, vec![Payload::frame_done(0, 3, false, 2)]);
        assert_eq!(desc.counters.residue(), 0);
    }

    #[test]
    fn paused_operator_withholds_propagation() {
        let desc = descriptor(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]), &[0]);
        let mut run = SlotRun::new(0, 0, engines(), Arc::clone(&desc));
        let mut out = Vec::new();
        run.advance(&mut out);
        assert_eq!(out, vec![Payload::op_done(0, 3, true, 0)]);
        assert_eq!(desc.counters.get(1), 1);

        out.clear();
        assert!(run.resume(0, &mut out));
        assert_eq!(types(&out), vec![MsgType::FrameDone]);
        assert!(!run.resume(0, &mut out));
    }

    #[test]
    fn source_waits_for_credit_and_sink_reports() {
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma)
                .consumer(1, EdgeKind::CompletedBy)
                .event(EventRole::Source(4)),
            Operator::new(1, OpType::Pdp).event(EventRole::Sink(9)),
        ]
        .into_iter()
        .collect();
        let desc = descriptor(&graph, &[]);
        let mut run = SlotRun::new(0, 0, engines(), desc);
        let mut out = Vec::new();
        run.advance(&mut out);
        assert!(out.is_empty());

        run.credit(0, &mut out);
        assert_eq!(
            out,
            vec![Payload::event_sink_done(0, 3, 9), Payload::frame_done(0, 3, false, 2)]
        );
    }

    #[test]
    fn enabled_consumer_waits_for_enabler() {
        // 1 is only enabled by 0; both on separate engines of the same core
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma).consumer(1, EdgeKind::EnabledBy),
            Operator::new(1, OpType::Pdp),
        ]
        .into_iter()
        .collect();
        let desc = descriptor(&graph, &[0]);
        let mut run = SlotRun::new(0, 0, engines(), Arc::clone(&desc));
        let mut out = Vec::new();
        run.advance(&mut out);
        // 0 paused before propagating, so 1 is not even programmed
        assert_eq!(desc.counters.get(1), 1);
        assert_eq!(run.executed(), 1);

        run.resume(0, &mut out);
        assert_eq!(run.executed(), 2);
        assert!(run.is_reported());
    }

    #[test]
    fn double_credit_stalls_instead_of_wrapping() {
        let desc = descriptor(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]), &[]);
        let mut run = SlotRun::new(0, 0, engines(), Arc::clone(&desc));
        let mut out = Vec::new();
        run.advance(&mut out);
        assert!(run.is_reported());

        let mut late = SlotRun::new(0, 0, engines(), desc);
        late.credit(1, &mut out);
        assert!(late.is_stalled());
    }
}
