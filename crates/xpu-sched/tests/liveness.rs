//! Watchdog expiry, completion races and misbehaving cores

mod common;

use common::{config, init_tracing, io, outcome, source_graph, wait_until, SETTLE};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xpu_sched::prelude::*;
use xpu_sched::SlotState;

fn main_engines() -> [OpType; 4] {
    [OpType::Dma, OpType::Conv, OpType::Pdp, OpType::Rubik]
}

/// A core that never reports done is reclaimed by the watchdog, slot and all
#[test]
fn test_watchdog_reclaims_hung_slot() {
    init_tracing();
    let cfg = config()
        .with_watchdog(Duration::from_millis(100))
        .with_cores(vec![
            CoreSpec::new("main", main_engines()).hanging(),
            CoreSpec::new("dsp", [OpType::Dsp]),
        ]);
    let cluster = Cluster::spawn(cfg).expect("spawn cluster");
    let exec = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]))
        .expect("load");

    let f1 = exec.submit(io(1)).expect("submit f1");
    let f2 = exec.submit(io(2)).expect("submit f2");
    let f3 = exec.submit(io(3)).expect("submit f3");
    for handle in [&f1, &f2, &f3] {
        let result = outcome(handle);
        assert_eq!(result.status, CompletionStatus::Timeout);
        assert!(result.stats.execution >= Duration::from_millis(100));
    }

    let sched = cluster.scheduler();
    assert!(wait_until(SETTLE, || sched.live_frames() == 0));
    assert_eq!(sched.slot_state(0), SlotState::Empty);
    assert_eq!(sched.slot_state(1), SlotState::Empty);
    assert_eq!(cluster.stats().timed_out, 3);
}

/// Watchdog and done race for the same slot: exactly one wins
#[test]
fn test_timeout_and_done_race_is_idempotent() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = Arc::new(cluster.load(&source_graph()).expect("load"));
    let sched = Arc::clone(cluster.scheduler());

    for n in 0..20 {
        let handle = exec.submit(io(n)).expect("submit");
        let id = handle.id();
        let slot = (0..2)
            .find(|s| sched.slot_state(*s) == SlotState::Sent(id))
            .expect("frame sent");

        let expiring = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || sched.on_watchdog(slot, id))
        };
        // fails harmlessly if the watchdog already failed the frame
        let _ = exec.push_event_source_credit(0);
        expiring.join().expect("watchdog thread");

        let result = outcome(&handle);
        assert!(matches!(
            result.status,
            CompletionStatus::Success | CompletionStatus::Timeout
        ));
        // a late expiry for a finished frame is a no-op
        sched.on_watchdog(slot, id);
        assert!(wait_until(SETTLE, || sched.live_frames() == 0));
    }

    let stats = cluster.stats();
    assert_eq!(stats.completed + stats.timed_out, 20);
    assert_eq!(stats.finished(), 20);
}

/// An out-of-range operator report fails that frame only
#[test]
fn test_protocol_violation_fails_only_that_frame() {
    init_tracing();
    let cfg = config().with_cores(vec![
        CoreSpec::new("main", main_engines()),
        CoreSpec::new("dsp", [OpType::Dsp]).corrupting(),
    ]);
    let cluster = Cluster::spawn(cfg).expect("spawn cluster");
    let healthy = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Pdp]))
        .expect("load healthy");
    let broken = cluster
        .load(&OperatorGraph::chain(&[OpType::Dma, OpType::Dsp]))
        .expect("load broken");

    let bad = broken.submit(io(1)).expect("submit bad");
    let good = healthy.submit(io(2)).expect("submit good");
    assert_eq!(outcome(&bad).status, CompletionStatus::Failed);
    assert!(outcome(&good).is_success());

    // the scheduler keeps going
    assert!(outcome(&healthy.submit(io(3)).expect("submit again")).is_success());
    let stats = cluster.stats();
    assert!(stats.protocol_violations >= 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 2);
}

/// Tearing a context down credits its stuck frames exactly once
#[test]
fn test_teardown_force_credits_in_flight_frames() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster.load(&source_graph()).expect("load");

    let f1 = exec.submit(io(1)).expect("submit f1");
    let f2 = exec.submit(io(2)).expect("submit f2");
    // f1 already has its credit; a second one would underflow its counter
    exec.push_event_source_credit(0).expect("credit f1");

    exec.teardown();
    assert!(!exec.is_alive());
    assert!(outcome(&f1).is_success());
    assert!(outcome(&f2).is_success());

    assert!(matches!(
        exec.submit(io(4)),
        Err(SchedError::ContextTornDown { .. })
    ));
    // idempotent
    exec.teardown();
    let stats = cluster.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.protocol_violations, 0);
}

/// Frames still queued at teardown fail without reaching a core
#[test]
fn test_teardown_fails_queued_frames() {
    init_tracing();
    let cluster = Cluster::spawn(config()).expect("spawn cluster");
    let exec = cluster.load(&source_graph()).expect("load");

    let sent: Vec<_> = (0..2).map(|n| exec.submit(io(n)).expect("submit")).collect();
    let queued = exec.submit(io(2)).expect("submit queued");
    assert_eq!(cluster.scheduler().queued(), 1);

    drop(exec);
    assert_eq!(outcome(&queued).status, CompletionStatus::Failed);
    assert_eq!(outcome(&queued).stats.cores, 0);
    for handle in &sent {
        assert!(outcome(handle).is_success());
    }
    assert_eq!(cluster.stats().sent, 2);
}
