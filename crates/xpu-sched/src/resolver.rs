//! Dependency resolution
//!
//! Turns the consumer-list graph into what a remote core can walk without
//! allocating: per-producer completion lists, one packed counter per
//! operator and per-engine sequences in compiled order.
//!
//! # Counter formula
//!
//! ```text
//! counter = 1                          own turn in the engine sequence
//!         + completed-by in-degree     runtime predecessor completions
//!         + programmed-by in-degree    ... minus the same, resolved here
//!         - programmed-by in-degree
//!         + 1 if event source          host credit
//! ```
//!
//! Enabled-by edges never count: they gate when the consumer may be
//! programmed, not when it may run.
//!
//! # Convolution broadcast
//!
//! The convolution engine announces completion through a dedicated broadcast
//! header, so completed-by edges leaving a convolution are kept in a separate
//! broadcast list (bounded by [`CONV_BROADCAST_MAX`]) instead of the bounded
//! completion list every other engine uses.

use crate::counters::DepCounters;
use crate::error::{Result, SchedError};
use crate::graph::{EventRole, OperatorGraph};
use tracing::{debug, info};
use xpu_proto::limits::{CONV_BROADCAST_MAX, COUNTER_MAX, MAX_COMPLETION_CONSUMERS, MAX_OPS};
use xpu_proto::op::OP_TYPE_COUNT;
use xpu_proto::{EdgeKind, OpType};

/// Producer-side record of one operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpMeta {
    /// Operator index
    pub index: u16,
    /// Engine
    pub ty: OpType,
    /// Counter value at the start of every frame
    pub counter: u8,
    /// Consumers told directly when this operator finishes
    pub completion: Vec<u16>,
    /// Consumers reached through the broadcast header (convolution only)
    pub broadcast: Vec<u16>,
    /// Consumer this operator's completion enables
    pub enable_consumer: Option<u16>,
    /// Producer whose completion enables this operator
    pub enabled_by: Option<u16>,
    /// Operator this one is fused onto
    pub fused_parent: Option<u16>,
    /// Event role
    pub event: Option<EventRole>,
    /// Edges satisfied by program order and removed at load
    pub programmed_by: u8,
}

impl OpMeta {
    /// Every consumer whose counter this operator decrements on completion
    pub fn completion_consumers(&self) -> impl Iterator<Item = u16> + '_ {
        self.completion.iter().chain(self.broadcast.iter()).copied()
    }

    /// Event index if this operator is a source
    pub const fn source_event(&self) -> Option<u16> {
        match self.event {
            Some(EventRole::Source(e)) => Some(e),
            _ => None,
        }
    }

    /// Event index if this operator is a sink
    pub const fn sink_event(&self) -> Option<u16> {
        match self.event {
            Some(EventRole::Sink(e)) => Some(e),
            _ => None,
        }
    }
}

/// Event index bound to an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBinding {
    /// Event index
    pub event: u16,
    /// Operator index
    pub op: u16,
}

/// Immutable output of resolution
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    ops: Vec<OpMeta>,
    per_type: [Vec<u16>; OP_TYPE_COUNT],
    template: DepCounters,
    sources: Vec<EventBinding>,
    sinks: Vec<EventBinding>,
}

impl ResolvedModel {
    /// Metadata by operator index
    pub fn ops(&self) -> &[OpMeta] {
        &self.ops
    }

    /// Metadata of operator `index`
    pub fn op(&self, index: u16) -> Option<&OpMeta> {
        self.ops.get(usize::from(index))
    }

    /// Number of operators
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Always false: empty graphs are rejected
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operators of engine `ty` in compiled order
    pub fn sequence(&self, ty: OpType) -> &[u16] {
        &self.per_type[ty.index()]
    }

    /// Operators per engine
    pub fn type_counts(&self) -> [usize; OP_TYPE_COUNT] {
        let mut counts = [0; OP_TYPE_COUNT];
        for ty in OpType::ALL {
            counts[ty.index()] = self.per_type[ty.index()].len();
        }
        counts
    }

    /// Engines with at least one operator
    pub fn engines(&self) -> impl Iterator<Item = OpType> + '_ {
        OpType::ALL
            .into_iter()
            .filter(|ty| !self.per_type[ty.index()].is_empty())
    }

    /// Counter values every frame starts from
    pub const fn template(&self) -> &DepCounters {
        &self.template
    }

    /// Event sources, by ascending event index
    pub fn sources(&self) -> &[EventBinding] {
        &self.sources
    }

    /// Event sinks, by ascending event index
    pub fn sinks(&self) -> &[EventBinding] {
        &self.sinks
    }

    /// Position in [`sources`](Self::sources) of the source for `event`
    pub fn source_slot(&self, event: u16) -> Option<usize> {
        self.sources.binary_search_by_key(&event, |b| b.event).ok()
    }

    /// Whether some sink operator reports `event`
    pub fn is_sink_event(&self, event: u16) -> bool {
        self.sinks.binary_search_by_key(&event, |b| b.event).is_ok()
    }
}

/// Resolve a compiled graph
///
/// # Errors
///
/// - [`SchedError::InvalidGraph`] for an empty graph, bad or duplicate
///   indices, self edges, a second enabled-by edge on either end, or a
///   duplicate event index
/// - [`SchedError::ResourceExhausted`] when a completion or broadcast list
///   overflows or a counter exceeds 15
pub fn resolve(graph: &OperatorGraph) -> Result<ResolvedModel> {
    let n = graph.len();
    if n == 0 {
        return Err(SchedError::invalid_graph("graph has no operators"));
    }
    if n > MAX_OPS {
        return Err(SchedError::invalid_graph(format!(
            "{n} operators exceed the {MAX_OPS} addressable by a message"
        )));
    }

    // Indices must be a permutation of 0..n.
    let mut seen = vec![false; n];
    for op in graph.ops() {
        let i = usize::from(op.index);
        if i >= n {
            return Err(SchedError::invalid_graph(format!(
                "operator index {i} out of range ({n} operators)"
            )));
        }
        if std::mem::replace(&mut seen[i], true) {
            return Err(SchedError::invalid_graph(format!("duplicate operator index {i}")));
        }
    }

    let mut ops: Vec<OpMeta> = Vec::with_capacity(n);
    ops.resize_with(n, || OpMeta {
        index: 0,
        ty: OpType::Dma,
        counter: 0,
        completion: Vec::new(),
        broadcast: Vec::new(),
        enable_consumer: None,
        enabled_by: None,
        fused_parent: None,
        event: None,
        programmed_by: 0,
    });
    let mut in_degree = vec![0u32; n];
    let mut programmed = vec![0u32; n];
    let mut per_type: [Vec<u16>; OP_TYPE_COUNT] = Default::default();

    for op in graph.ops() {
        let p = usize::from(op.index);
        let ty = op.op_type();
        ops[p].index = op.index;
        ops[p].ty = ty;
        ops[p].event = op.event;
        per_type[ty.index()].push(op.index);

        if let Some(parent) = op.fused_parent {
            if usize::from(parent) >= n || parent == op.index {
                return Err(SchedError::invalid_graph(format!(
                    "operator {p} fused to invalid parent {parent}"
                )));
            }
            ops[p].fused_parent = Some(parent);
        }
    }

    for op in graph.ops() {
        let p = usize::from(op.index);
        for edge in &op.consumers {
            let c = usize::from(edge.consumer);
            if c >= n {
                return Err(SchedError::invalid_graph(format!(
                    "operator {p} lists consumer {c} out of range ({n} operators)"
                )));
            }
            if c == p {
                return Err(SchedError::invalid_graph(format!(
                    "operator {p} depends on itself"
                )));
            }
            match edge.kind {
                EdgeKind::EnabledBy => {
                    if let Some(prev) = ops[p].enable_consumer {
                        return Err(SchedError::invalid_graph(format!(
                            "operator {p} enables both {prev} and {c}"
                        )));
                    }
                    if let Some(prev) = ops[c].enabled_by {
                        return Err(SchedError::invalid_graph(format!(
                            "operator {c} enabled by both {prev} and {p}"
                        )));
                    }
                    ops[p].enable_consumer = Some(edge.consumer);
                    ops[c].enabled_by = Some(op.index);
                }
                EdgeKind::CompletedBy => {
                    in_degree[c] += 1;
                    if ops[p].ty.has_broadcast_header() {
                        push_bounded(
                            &mut ops[p].broadcast,
                            edge.consumer,
                            CONV_BROADCAST_MAX,
                            p,
                            "broadcast",
                        )?;
                    } else {
                        push_bounded(
                            &mut ops[p].completion,
                            edge.consumer,
                            MAX_COMPLETION_CONSUMERS,
                            p,
                            "completion",
                        )?;
                    }
                }
                EdgeKind::ProgrammedBy => {
                    in_degree[c] += 1;
                    programmed[c] += 1;
                }
            }
        }
    }

    let mut sources = Vec::new();
    let mut sinks = Vec::new();
    let mut values = Vec::with_capacity(n);
    for (i, meta) in ops.iter_mut().enumerate() {
        let source = match meta.event {
            Some(EventRole::Source(event)) => {
                sources.push(EventBinding { event, op: meta.index });
                1
            }
            Some(EventRole::Sink(event)) => {
                sinks.push(EventBinding { event, op: meta.index });
                0
            }
            None => 0,
        };
        let counter = 1 + in_degree[i] - programmed[i] + source;
        if counter > u32::from(COUNTER_MAX) {
            return Err(SchedError::exhausted(
                format!("dependency count {counter} of operator {i}"),
                usize::from(COUNTER_MAX),
            ));
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            meta.counter = counter as u8;
            meta.programmed_by = programmed[i].min(255) as u8;
        }
        values.push(meta.counter);
    }

    sources.sort_by_key(|b| b.event);
    sinks.sort_by_key(|b| b.event);
    for (list, role) in [(&sources, "source"), (&sinks, "sink")] {
        if let Some(w) = list.windows(2).find(|w| w[0].event == w[1].event) {
            return Err(SchedError::invalid_graph(format!(
                "event {} bound to two {role} operators ({} and {})",
                w[0].event, w[0].op, w[1].op
            )));
        }
    }

    let template = DepCounters::from_values(&values)?;
    debug!("Counter template: {:?}", values);
    info!(
        "Resolved model: {} operators, {} sources, {} sinks, per-type {:?}",
        n,
        sources.len(),
        sinks.len(),
        per_type.iter().map(Vec::len).collect::<Vec<_>>()
    );

    Ok(ResolvedModel {
        ops,
        per_type,
        template,
        sources,
        sinks,
    })
}

fn push_bounded(
    list: &mut Vec<u16>,
    consumer: u16,
    capacity: usize,
    producer: usize,
    what: &str,
) -> Result<()> {
    if list.len() >= capacity {
        return Err(SchedError::exhausted(
            format!("{what} list of operator {producer}"),
            capacity,
        ));
    }
    list.push(consumer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Operator;

    fn chain_abc() -> OperatorGraph {
        OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma])
    }

    #[test]
    fn chain_counters_and_propagation() {
        let model = resolve(&chain_abc()).unwrap();
        let live = model.template().clone();
        assert_eq!(live.snapshot(), vec![1, 2, 2]);

        // A is programmed and runs; its completion reaches B
        live.decrement(0).unwrap();
        for c in model.ops()[0].completion_consumers() {
            live.decrement(usize::from(c)).unwrap();
        }
        assert_eq!(live.get(1), 1);

        live.decrement(1).unwrap();
        for c in model.ops()[1].completion_consumers() {
            live.decrement(usize::from(c)).unwrap();
        }
        assert_eq!(live.get(2), 1);

        live.decrement(2).unwrap();
        assert_eq!(model.ops()[2].completion_consumers().count(), 0);
        assert_eq!(live.residue(), 0);
    }

    #[test]
    fn counter_is_one_plus_unresolved_edges() {
        // 0 and 1 complete into 3; 2 is program-ordered before 3
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma).consumer(3, EdgeKind::CompletedBy),
            Operator::new(1, OpType::Pdp).consumer(3, EdgeKind::CompletedBy),
            Operator::new(2, OpType::Rubik).consumer(3, EdgeKind::ProgrammedBy),
            Operator::new(3, OpType::Dma),
        ]
        .into_iter()
        .collect();
        let model = resolve(&graph).unwrap();
        assert_eq!(model.ops()[3].counter, 3);
        assert_eq!(model.ops()[3].programmed_by, 1);
        assert_eq!(model.ops()[2].completion, Vec::<u16>::new());
    }

    #[test]
    fn enabled_by_does_not_count() {
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma).consumer(1, EdgeKind::EnabledBy),
            Operator::new(1, OpType::Dma),
        ]
        .into_iter()
        .collect();
        let model = resolve(&graph).unwrap();
        assert_eq!(model.ops()[1].counter, 1);
        assert_eq!(model.ops()[0].enable_consumer, Some(1));
        assert_eq!(model.ops()[1].enabled_by, Some(0));
    }

    #[test]
    fn second_enable_edge_rejected() {
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma)
                .consumer(1, EdgeKind::EnabledBy)
                .consumer(2, EdgeKind::EnabledBy),
            Operator::new(1, OpType::Dma),
            Operator::new(2, OpType::Dma),
        ]
        .into_iter()
        .collect();
        assert!(matches!(resolve(&graph), Err(SchedError::InvalidGraph { .. })));
    }

    #[test]
    fn completion_list_overflow_aborts_load() {
        let mut producer = Operator::new(0, OpType::Dma);
        for c in 1..=6 {
            producer = producer.consumer(c, EdgeKind::CompletedBy);
        }
        let mut graph = OperatorGraph::new();
        graph.push(producer);
        for c in 1..=6 {
            graph.push(Operator::new(c, OpType::Pdp));
        }
        assert!(matches!(
            resolve(&graph),
            Err(SchedError::ResourceExhausted { capacity: 5, .. })
        ));
    }

    #[test]
    fn conv_fans_out_through_broadcast_list() {
        let mut producer = Operator::new(0, OpType::Conv);
        for c in 1..=8 {
            producer = producer.consumer(c, EdgeKind::CompletedBy);
        }
        let mut graph = OperatorGraph::new();
        graph.push(producer);
        for c in 1..=8 {
            graph.push(Operator::new(c, OpType::Pdp));
        }
        let model = resolve(&graph).unwrap();
        assert!(model.ops()[0].completion.is_empty());
        assert_eq!(model.ops()[0].broadcast.len(), 8);
        assert_eq!(model.ops()[0].completion_consumers().count(), 8);
    }

    #[test]
    fn unrepresentable_counter_aborts_load() {
        let mut graph = OperatorGraph::new();
        for p in 0..15u16 {
            graph.push(Operator::new(p, OpType::Dsp).consumer(15, EdgeKind::CompletedBy));
        }
        graph.push(Operator::new(15, OpType::Dsp));
        assert!(matches!(
            resolve(&graph),
            Err(SchedError::ResourceExhausted { capacity: 15, .. })
        ));
    }

    #[test]
    fn event_sources_wait_for_a_credit() {
        let graph: OperatorGraph = [
            Operator::new(0, OpType::Dma)
                .event(EventRole::Source(7))
                .consumer(1, EdgeKind::CompletedBy),
            Operator::new(1, OpType::Dma).event(EventRole::Sink(3)),
        ]
        .into_iter()
        .collect();
        let model = resolve(&graph).unwrap();
        assert_eq!(model.ops()[0].counter, 2);
        assert_eq!(model.sources(), &[EventBinding { event: 7, op: 0 }]);
        assert_eq!(model.sinks(), &[EventBinding { event: 3, op: 1 }]);
        assert_eq!(model.source_slot(7), Some(0));
        assert_eq!(model.source_slot(3), None);
    }

    #[test]
    fn malformed_graphs_rejected() {
        assert!(resolve(&OperatorGraph::new()).is_err());

        let self_edge: OperatorGraph =
            [Operator::new(0, OpType::Dma).consumer(0, EdgeKind::CompletedBy)]
                .into_iter()
                .collect();
        assert!(resolve(&self_edge).is_err());

        let dangling: OperatorGraph =
            [Operator::new(0, OpType::Dma).consumer(4, EdgeKind::CompletedBy)]
                .into_iter()
                .collect();
        assert!(resolve(&dangling).is_err());

        let duplicate: OperatorGraph =
            [Operator::new(0, OpType::Dma), Operator::new(0, OpType::Pdp)]
                .into_iter()
                .collect();
        assert!(resolve(&duplicate).is_err());

        let bad_parent: OperatorGraph =
            [Operator::new(0, OpType::Dma).fused_to(3)].into_iter().collect();
        assert!(resolve(&bad_parent).is_err());

        let twin_sources: OperatorGraph = [
            Operator::new(0, OpType::Dma).event(EventRole::Source(1)),
            Operator::new(1, OpType::Dma).event(EventRole::Source(1)),
        ]
        .into_iter()
        .collect();
        assert!(resolve(&twin_sources).is_err());
    }

    #[test]
    fn sequences_follow_compiled_order() {
        let graph: OperatorGraph = [
            Operator::new(2, OpType::Dma),
            Operator::new(0, OpType::Pdp),
            Operator::new(1, OpType::Dma),
        ]
        .into_iter()
        .collect();
        let model = resolve(&graph).unwrap();
        assert_eq!(model.sequence(OpType::Dma), &[2, 1]);
        assert_eq!(model.sequence(OpType::Pdp), &[0]);
        assert_eq!(model.type_counts(), [2, 0, 1, 0, 0]);
        assert_eq!(model.engines().collect::<Vec<_>>(), vec![OpType::Dma, OpType::Pdp]);
    }
}
