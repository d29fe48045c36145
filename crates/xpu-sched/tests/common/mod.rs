//! Shared helpers for the cluster integration tests

#![allow(dead_code)]

use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use xpu_sched::prelude::*;
use xpu_sched::FrameOutcome;

/// Generous bound for anything the software cores should finish quickly
pub const SETTLE: Duration = Duration::from_secs(5);

/// Route logs through the test harness (`RUST_LOG=debug cargo test`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default layout with a watchdog short enough for tests
pub fn config() -> SchedConfig {
    SchedConfig::default().with_watchdog(Duration::from_secs(10))
}

/// One input and one output tensor, distinct per `n`
pub fn io(n: u64) -> IoBindings {
    IoBindings::single(TensorHandle::new(2 * n, 1024), TensorHandle::new(2 * n + 1, 2048))
}

/// DMA (event source 0) feeding PDP: every frame waits for one host credit
pub fn source_graph() -> OperatorGraph {
    [
        Operator::new(0, OpType::Dma)
            .consumer(1, EdgeKind::CompletedBy)
            .event(EventRole::Source(0)),
        Operator::new(1, OpType::Pdp),
    ]
    .into_iter()
    .collect()
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Wait for a frame, failing the test if it never resolves
pub fn outcome(handle: &FrameHandle) -> FrameOutcome {
    handle.wait_timeout(SETTLE).expect("frame did not resolve in time")
}
