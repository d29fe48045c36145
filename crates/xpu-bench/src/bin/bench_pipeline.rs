//! Frames per second through the software cluster.
//!
//! Every graph is loaded once and driven with a window of outstanding
//! frames. With two tiktok slots the window only matters for how quickly the
//! next frame is admitted once a slot frees up.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xpu_proto::{EdgeKind, OpType};
use xpu_sched::{
    Cluster, CompletionStatus, IoBindings, Operator, OperatorGraph, SchedConfig, TensorHandle,
};

const FRAMES: u64 = 2_000;
const WINDOWS: [usize; 3] = [1, 2, 8];

fn graphs() -> Vec<(&'static str, OperatorGraph)> {
    vec![
        ("chain-3", OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma])),
        (
            "chain-5",
            OperatorGraph::chain(&[
                OpType::Dma,
                OpType::Conv,
                OpType::Pdp,
                OpType::Rubik,
                OpType::Dma,
            ]),
        ),
        ("dsp-handoff", OperatorGraph::chain(&[OpType::Dma, OpType::Dsp, OpType::Dma])),
        (
            "diamond",
            [
                Operator::new(0, OpType::Dma)
                    .consumer(1, EdgeKind::CompletedBy)
                    .consumer(2, EdgeKind::CompletedBy),
                Operator::new(1, OpType::Conv).consumer(3, EdgeKind::CompletedBy),
                Operator::new(2, OpType::Pdp).consumer(3, EdgeKind::CompletedBy),
                Operator::new(3, OpType::Dma),
            ]
            .into_iter()
            .collect(),
        ),
    ]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    println!("Two-slot pipeline throughput ({FRAMES} frames per run)");
    println!("=====================================================");
    println!();

    let mut cluster = Cluster::spawn(SchedConfig::from_env())?;

    println!(
        "  {:<12}  {:>6}  {:>10}  {:>12}  {:>12}",
        "graph", "window", "ms", "frames/s", "mean exec µs"
    );
    println!("  {:-<12}  {:-<6}  {:-<10}  {:-<12}  {:-<12}", "", "", "", "", "");

    for (name, graph) in graphs() {
        let exec = cluster.load(&graph)?;
        info!("Loaded {} as context {} on cores {:?}", name, exec.context_id(), exec.cores());
        for window in WINDOWS {
            let mut pending = VecDeque::with_capacity(window);
            let mut exec_us = 0u128;
            let t0 = Instant::now();
            for n in 0..FRAMES {
                if pending.len() == window {
                    if let Some(handle) = pending.pop_front() {
                        exec_us += finish(&handle)?;
                    }
                }
                let io = IoBindings::single(
                    TensorHandle::new(2 * n, 4096),
                    TensorHandle::new(2 * n + 1, 4096),
                );
                pending.push_back(exec.submit(io)?);
            }
            for handle in pending.drain(..) {
                exec_us += finish(&handle)?;
            }
            let secs = t0.elapsed().as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            let rate = FRAMES as f64 / secs;
            println!(
                "  {:<12}  {:>6}  {:>10.1}  {:>12.0}  {:>12}",
                name,
                window,
                secs * 1e3,
                rate,
                exec_us / u128::from(FRAMES)
            );
        }
    }

    cluster.shutdown();
    let stats = cluster.stats();
    println!();
    println!(
        "  completed={} relayed={} timed_out={} violations={}",
        stats.completed, stats.relayed, stats.timed_out, stats.protocol_violations
    );
    Ok(())
}

fn finish(handle: &xpu_sched::FrameHandle) -> Result<u128> {
    let outcome = handle.wait();
    if outcome.status != CompletionStatus::Success {
        bail!("frame {} ended {:?}", handle.id(), outcome.status);
    }
    Ok(outcome.stats.execution.as_micros())
}
