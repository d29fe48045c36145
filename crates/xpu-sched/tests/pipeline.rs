//! End-to-end frame scheduling through the software cluster

mod common;

use common::{config, init_tracing, io, outcome, source_graph, wait_until, SETTLE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use xpu_sched::prelude::*;
use xpu_sched::{SchedError, SlotState};

/// A → B → C on one core completes with every counter drained
#[test]
fn test_chain_completes() {
    init_tracing();
    let cluster = Cluster::spawn(config().with_capture_stats(true)).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma]))
        .expect("load chain");
    assert_eq!(exec.model().template().snapshot(), vec![1, 2, 2]);

    let result = outcome(&exec.submit(io(0)).expect("submit"));
    assert_eq!(result.status, CompletionStatus::Success);
    assert_eq!(result.stats.ops_completed, 3);
    assert_eq!(result.stats.cores, 1);
    assert_eq!(result.stats.counter_residue, Some(0));
    assert!(result.stats.total >= result.stats.execution);

    let stats = cluster.stats();
    assert_eq!((stats.submitted, stats.sent, stats.completed), (1, 1, 1));
    assert_eq!(stats.protocol_violations, 0);
}

/// Many frames, all succeed, callbacks fire once each, slots end empty
#[test]
fn test_many_frames_drain() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let graph = OperatorGraph::chain(&[
        OpType::Dma,
        OpType::Conv,
        OpType::Pdp,
        OpType::Rubik,
        OpType::Dma,
    ]);
    let exec = cluster.load(&graph).expect("load");

    let fired = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..50)
        .map(|n| {
            let fired = Arc::clone(&fired);
            exec.submit_with(io(n), move |_, outcome| {
                assert!(outcome.is_success());
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit")
        })
        .collect();

    for handle in &handles {
        assert!(outcome(handle).is_success());
    }
    assert!(wait_until(SETTLE, || fired.load(Ordering::SeqCst) == 50));

    let sched = cluster.scheduler();
    assert!(wait_until(SETTLE, || sched.live_frames() == 0));
    assert_eq!(sched.slot_state(0), SlotState::Empty);
    assert_eq!(sched.slot_state(1), SlotState::Empty);
    assert_eq!(cluster.stats().completed, 50);
}

/// Never more than two frames on the cores; the third waits its turn
#[test]
fn test_third_frame_queued() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster.load(&source_graph()).expect("load");
    let sched = cluster.scheduler();

    let f1 = exec.submit(io(1)).expect("submit f1");
    let f2 = exec.submit(io(2)).expect("submit f2");
    let f3 = exec.submit(io(3)).expect("submit f3");

    assert_eq!(sched.in_flight(), 2);
    assert_eq!(sched.queued(), 1);
    assert_eq!(sched.slot_state(0), SlotState::Sent(f1.id()));
    assert_eq!(sched.slot_state(1), SlotState::Sent(f2.id()));
    assert!(f3.try_outcome().is_none());

    for _ in 0..3 {
        exec.push_event_source_credit(0).expect("credit");
    }
    for handle in [&f1, &f2, &f3] {
        assert!(outcome(handle).is_success());
    }
    assert!(outcome(&f3).stats.queued > std::time::Duration::ZERO);

    // every live frame is credited, nothing left to credit
    assert!(wait_until(SETTLE, || sched.live_frames() == 0));
    assert!(matches!(
        exec.push_event_source_credit(0),
        Err(SchedError::InvalidState { .. })
    ));
}

/// Slot 1 finishes first; the queued frame takes slot 1
#[test]
fn test_slot_one_completes_first() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let a = cluster.load(&source_graph()).expect("load a");
    let b = cluster.load(&source_graph()).expect("load b");
    let sched = cluster.scheduler();

    let f1 = a.submit(io(1)).expect("submit f1");
    let f2 = b.submit(io(2)).expect("submit f2");
    let f3 = a.submit(io(3)).expect("submit f3");
    assert_eq!(sched.slot_state(0), SlotState::Sent(f1.id()));
    assert_eq!(sched.slot_state(1), SlotState::Sent(f2.id()));

    b.push_event_source_credit(0).expect("credit b");
    assert!(outcome(&f2).is_success());
    assert!(wait_until(SETTLE, || sched.slot_state(1) == SlotState::Sent(f3.id())));
    assert_eq!(sched.slot_state(0), SlotState::Sent(f1.id()));
    assert!(f1.try_outcome().is_none());

    a.push_event_source_credit(0).expect("credit f1");
    a.push_event_source_credit(0).expect("credit f3");
    assert!(outcome(&f1).is_success());
    assert!(outcome(&f3).is_success());
}

/// DSP operators run on the second core; completions cross via the host
#[test]
fn test_dsp_handoff() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Dsp, OpType::Dma]))
        .expect("load");
    assert_eq!(exec.cores(), &[0, 1]);

    let result = outcome(&exec.submit(io(0)).expect("submit"));
    assert!(result.is_success());
    assert_eq!(result.stats.cores, 2);
    assert_eq!(result.stats.ops_completed, 3);
    assert_eq!(cluster.stats().relayed, 2);
}

/// Enabled-by edges must stay on one core
#[test]
fn test_cross_core_enable_rejected() {
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let graph: OperatorGraph = [
        Operator::new(0, OpType::Dma).consumer(1, EdgeKind::EnabledBy),
        Operator::new(1, OpType::Dsp),
    ]
    .into_iter()
    .collect();
    assert!(matches!(cluster.load(&graph), Err(SchedError::InvalidGraph { .. })));
}

/// Engines with no core cannot be loaded
#[test]
fn test_engine_without_core_rejected() {
    let cluster = Cluster::spawn(config().with_cores(vec![CoreSpec::new("main", [OpType::Dma])]))
        .expect("spawn cluster");
    let result = cluster.load(&OperatorGraph::chain(&[OpType::Dma, OpType::Conv]));
    assert!(matches!(result, Err(SchedError::InvalidGraph { .. })));
}

/// Buffers are released when frames finish and the program when the model goes
#[test]
fn test_buffers_released() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let binder = Arc::clone(cluster.scheduler().binder());
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]))
        .expect("load");
    let program_maps = binder.live();
    assert_eq!(program_maps, 2);

    assert!(outcome(&exec.submit(io(0)).expect("submit")).is_success());
    assert!(wait_until(SETTLE, || binder.live() == program_maps));

    drop(exec);
    assert!(wait_until(SETTLE, || binder.live() == 0));
}

/// Shutdown refuses new work and fails what is still waiting
#[test]
fn test_shutdown_fails_outstanding() {
    init_tracing();
    let mut cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster.load(&source_graph()).expect("load");
    let stuck: Vec<_> = (0..3).map(|n| exec.submit(io(n)).expect("submit")).collect();

    cluster.shutdown();
    for handle in &stuck {
        assert_eq!(outcome(handle).status, CompletionStatus::Failed);
    }
    assert!(matches!(exec.submit(io(9)), Err(SchedError::InvalidState { .. })));
    assert_eq!(cluster.stats().failed, 3);
}
