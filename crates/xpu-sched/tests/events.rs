//! Pause/resume, event sources and event sinks

mod common;

use common::{config, init_tracing, io, outcome, source_graph, wait_until, SETTLE};
use std::time::Duration;
use xpu_sched::prelude::*;
use xpu_sched::SchedError;

/// A paused operator holds the frame until the host resumes it
#[test]
fn test_pause_and_resume() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma]))
        .expect("load");
    exec.set_pause_list(&[1]).expect("pause list");

    assert!(matches!(exec.resume(1), Err(SchedError::InvalidState { .. })));

    let handle = exec.submit(io(0)).expect("submit");
    assert!(wait_until(SETTLE, || exec.resume(1).is_ok()));
    assert!(outcome(&handle).is_success());

    // the list applies to every later frame until replaced
    let again = exec.submit(io(1)).expect("submit");
    assert!(wait_until(SETTLE, || exec.resume(1).is_ok()));
    assert!(outcome(&again).is_success());

    exec.set_pause_list(&[]).expect("clear pause list");
    assert!(outcome(&exec.submit(io(2)).expect("submit")).is_success());
}

/// Resume goes to the oldest frame that reported the operator paused
#[test]
fn test_resume_oldest_first() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]))
        .expect("load");
    exec.set_pause_list(&[0]).expect("pause list");

    let first = exec.submit(io(0)).expect("submit first");
    let second = exec.submit(io(1)).expect("submit second");
    assert!(wait_until(SETTLE, || exec.resume(0).is_ok()));
    assert!(outcome(&first).is_success());
    assert!(second.try_outcome().is_none());

    assert!(wait_until(SETTLE, || exec.resume(0).is_ok()));
    assert!(outcome(&second).is_success());
}

/// Pause lists are bounded and validated
#[test]
fn test_pause_list_validation() {
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]))
        .expect("load");
    let too_many: Vec<u16> = (0..33).collect();
    assert!(matches!(
        exec.set_pause_list(&too_many),
        Err(SchedError::ResourceExhausted { .. })
    ));
    assert!(matches!(
        exec.set_pause_list(&[2]),
        Err(SchedError::InvalidGraph { .. })
    ));
}

/// Credits given while a frame is queued are applied when it is sent
#[test]
fn test_source_credit_for_queued_frame() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster.load(&source_graph()).expect("load");
    let handles: Vec<_> = (0..4).map(|n| exec.submit(io(n)).expect("submit")).collect();
    assert_eq!(cluster.scheduler().queued(), 2);

    for _ in 0..4 {
        exec.push_event_source_credit(0).expect("credit");
    }
    for handle in &handles {
        assert!(outcome(handle).is_success());
    }
    assert!(matches!(
        exec.push_event_source_credit(7),
        Err(SchedError::InvalidState { .. })
    ));
}

/// Sink notifications reach the executor in order; overflow drops and counts
#[test]
fn test_sink_events_and_overflow() {
    init_tracing();
    let cluster = Cluster::spawn(config().with_event_cache(2)).expect("spawn cluster");
    let graph: OperatorGraph = [
        Operator::new(0, OpType::Dma)
            .consumer(1, EdgeKind::CompletedBy)
            .event(EventRole::Sink(10)),
        Operator::new(1, OpType::Pdp)
            .consumer(2, EdgeKind::CompletedBy)
            .event(EventRole::Sink(11)),
        Operator::new(2, OpType::Dma).event(EventRole::Sink(12)),
    ]
    .into_iter()
    .collect();
    let exec = cluster.load(&graph).expect("load");

    assert!(outcome(&exec.submit(io(0)).expect("submit")).is_success());
    assert_eq!(exec.wait_event_sink(Duration::from_secs(1)), Some(10));
    assert_eq!(exec.poll_event_sink(), Some(11));
    assert_eq!(exec.poll_event_sink(), None);
    assert_eq!(exec.dropped_events(), 1);
    assert_eq!(cluster.stats().dropped_events, 1);

    // the cache has room again
    assert!(outcome(&exec.submit(io(1)).expect("submit")).is_success());
    assert_eq!(exec.poll_event_sink(), Some(10));
}

/// Sinks on the DSP core report through their own channel
#[test]
fn test_sink_on_remote_core() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let graph: OperatorGraph = [
        Operator::new(0, OpType::Dma).consumer(1, EdgeKind::CompletedBy),
        Operator::new(1, OpType::Dsp).event(EventRole::Sink(3)),
    ]
    .into_iter()
    .collect();
    let exec = cluster.load(&graph).expect("load");
    assert!(outcome(&exec.submit(io(0)).expect("submit")).is_success());
    assert_eq!(exec.wait_event_sink(Duration::from_secs(1)), Some(3));
}
