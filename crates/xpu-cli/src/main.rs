//! `xpu`: command-line interface for the accelerator frame scheduler.
//!
//! ```text
//! USAGE:
//!   xpu inspect <topology>           Resolve a graph and print its counters
//!   xpu run <topology> [-n frames]   Run frames through the software cluster
//!   xpu channel [--slots N]          Ping-pong messages over one channel pair
//! ```

use anyhow::{bail, Result};
use bytes::BytesMut;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xpu_proto::op::OP_TYPE_COUNT;
use xpu_proto::{EdgeKind, OpType, Payload};
use xpu_sched::doorbell::Doorbell;
use xpu_sched::{
    channel_pair, resolve, CompletionStatus, CoreSpec, Cluster, EnvelopeEncoder, EventRole,
    IoBindings, Operator, OperatorGraph, ProgramEncoder, SchedConfig, TensorHandle,
};

#[derive(Parser)]
#[command(name = "xpu", about = "Accelerator frame scheduler CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Resolve a built-in graph and print the per-operator records.
    Inspect {
        /// Graph to resolve.
        #[arg(value_enum)]
        topology: Topology,
    },
    /// Run frames of a built-in graph through the software cluster.
    Run {
        /// Graph to run.
        #[arg(value_enum)]
        topology: Topology,
        /// Number of frames to submit.
        #[arg(short = 'n', long, default_value_t = 8)]
        frames: u64,
        /// Watchdog timeout in milliseconds (overrides XPU_WATCHDOG_MS).
        #[arg(long)]
        watchdog_ms: Option<u64>,
        /// Request statistics capture on every frame.
        #[arg(long)]
        capture: bool,
        /// Make the main core swallow its FrameDone reports.
        #[arg(long)]
        hang: bool,
    },
    /// Exchange messages over one channel pair and report throughput.
    Channel {
        /// Reserved slots on each side (rounded up to a power of two).
        #[arg(long, default_value_t = 64)]
        slots: usize,
        /// Messages to send in each direction.
        #[arg(long, default_value_t = 100_000)]
        messages: u32,
    },
}

/// Built-in operator graphs
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Topology {
    /// DMA → PDP → DMA on the main core.
    Chain,
    /// DMA fans out to CONV and PDP, both feed a final DMA.
    Diamond,
    /// DMA → DSP → DMA, crossing cores twice.
    DspHandoff,
    /// DMA waits for a host credit, PDP reports a sink event.
    Events,
}

impl Topology {
    fn graph(self) -> OperatorGraph {
        match self {
            Self::Chain => OperatorGraph::chain(&[OpType::Dma, OpType::Pdp, OpType::Dma]),
            Self::DspHandoff => OperatorGraph::chain(&[OpType::Dma, OpType::Dsp, OpType::Dma]),
            Self::Diamond => [
                Operator::new(0, OpType::Dma)
                    .consumer(1, EdgeKind::CompletedBy)
                    .consumer(2, EdgeKind::CompletedBy),
                Operator::new(1, OpType::Conv).consumer(3, EdgeKind::CompletedBy),
                Operator::new(2, OpType::Pdp).consumer(3, EdgeKind::CompletedBy),
                Operator::new(3, OpType::Dma),
            ]
            .into_iter()
            .collect(),
            Self::Events => [
                Operator::new(0, OpType::Dma)
                    .consumer(1, EdgeKind::CompletedBy)
                    .event(EventRole::Source(0)),
                Operator::new(1, OpType::Pdp).event(EventRole::Sink(1)),
            ]
            .into_iter()
            .collect(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { topology } => cmd_inspect(topology)?,
        Cmd::Run {
            topology,
            frames,
            watchdog_ms,
            capture,
            hang,
        } => cmd_run(topology, frames, watchdog_ms, capture, hang)?,
        Cmd::Channel { slots, messages } => cmd_channel(slots, messages)?,
    }

    Ok(())
}

fn cmd_inspect(topology: Topology) -> Result<()> {
    let graph = topology.graph();
    let model = resolve(&graph)?;

    println!("{topology:?}: {} operators", model.len());
    println!();
    println!(
        "  {:>4}  {:<6}  {:>7}  {:<14}  {:<14}  {:<8}",
        "op", "engine", "counter", "completion", "broadcast", "event"
    );
    println!("  {:-<4}  {:-<6}  {:-<7}  {:-<14}  {:-<14}  {:-<8}", "", "", "", "", "", "");
    for meta in model.ops() {
        let event = match meta.event {
            Some(EventRole::Source(e)) => format!("src {e}"),
            Some(EventRole::Sink(e)) => format!("sink {e}"),
            None => String::new(),
        };
        println!(
            "  {:>4}  {:<6}  {:>7}  {:<14}  {:<14}  {:<8}",
            meta.index,
            meta.ty.name(),
            meta.counter,
            format!("{:?}", meta.completion),
            format!("{:?}", meta.broadcast),
            event
        );
    }

    println!();
    let counts = model.type_counts();
    for ty in OpType::ALL {
        if counts[ty.index()] > 0 {
            println!("  {:<6} sequence {:?}", ty.name(), model.sequence(ty));
        }
    }

    let mut bytes = [0usize; OP_TYPE_COUNT];
    let mut scratch = BytesMut::new();
    for op in graph.ops() {
        if let Some(meta) = model.op(op.index) {
            scratch.clear();
            EnvelopeEncoder.encode(op, meta, &mut scratch)?;
            bytes[meta.ty.index()] += scratch.len();
        }
    }
    println!();
    println!("  program bytes per engine: {bytes:?}");
    println!("  packed counters: {:02x?}", model.template().packed());
    Ok(())
}

fn cmd_run(
    topology: Topology,
    frames: u64,
    watchdog_ms: Option<u64>,
    capture: bool,
    hang: bool,
) -> Result<()> {
    let mut config = SchedConfig::from_env().with_capture_stats(capture);
    if let Some(ms) = watchdog_ms {
        config = config.with_watchdog(Duration::from_millis(ms));
    }
    if hang {
        let cores = config
            .cores
            .iter()
            .cloned()
            .map(|c| if c.owns(OpType::Dma) { c.hanging() } else { c })
            .collect::<Vec<CoreSpec>>();
        config = config.with_cores(cores);
    }

    let mut cluster = Cluster::spawn(config)?;
    let exec = cluster.load(&topology.graph())?;
    info!("Loaded {:?} as context {}", topology, exec.context_id());

    let t0 = Instant::now();
    let handles = (0..frames)
        .map(|n| {
            let io = IoBindings::single(
                TensorHandle::new(2 * n, 4096),
                TensorHandle::new(2 * n + 1, 4096),
            );
            exec.submit(io)
        })
        .collect::<xpu_sched::Result<Vec<_>>>()?;

    if matches!(topology, Topology::Events) {
        for _ in 0..frames {
            exec.push_event_source_credit(0)?;
        }
    }

    println!(
        "  {:>6}  {:<8}  {:>10}  {:>10}  {:>5}  {:>4}",
        "frame", "status", "queued µs", "exec µs", "cores", "ops"
    );
    println!("  {:-<6}  {:-<8}  {:-<10}  {:-<10}  {:-<5}  {:-<4}", "", "", "", "", "", "");
    let mut failures = 0;
    for handle in &handles {
        let outcome = handle.wait();
        if outcome.status != CompletionStatus::Success {
            failures += 1;
        }
        println!(
            "  {:>6}  {:<8}  {:>10}  {:>10}  {:>5}  {:>4}",
            handle.id().to_string(),
            format!("{:?}", outcome.status),
            outcome.stats.queued.as_micros(),
            outcome.stats.execution.as_micros(),
            outcome.stats.cores,
            outcome.stats.ops_completed
        );
    }
    let elapsed = t0.elapsed();

    let mut sinks = Vec::new();
    while let Some(event) = exec.poll_event_sink() {
        sinks.push(event);
    }

    drop(exec);
    cluster.shutdown();
    let stats = cluster.stats();
    println!();
    println!(
        "  {} frames in {:.1} ms ({:.0} frames/s)",
        frames,
        elapsed.as_secs_f64() * 1e3,
        frames as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  completed={} timed_out={} failed={} stale={} relayed={} violations={}",
        stats.completed,
        stats.timed_out,
        stats.failed,
        stats.stale_messages,
        stats.relayed,
        stats.protocol_violations
    );
    if !sinks.is_empty() {
        println!("  sink events: {} (dropped {})", sinks.len(), stats.dropped_events);
    }

    if failures > 0 && !hang {
        bail!("{failures} of {frames} frames did not succeed");
    }
    Ok(())
}

fn cmd_channel(slots: usize, messages: u32) -> Result<()> {
    let host_bell = Arc::new(Doorbell::new());
    let peer_bell = Arc::new(Doorbell::new());
    let (host, peer) = channel_pair(slots, slots, host_bell, peer_bell)?;
    println!("Channel pair: fifo_size={}", host.fifo_size());

    let (mut tx, mut rx) = host.split();
    let (mut peer_tx, mut peer_rx) = peer.split();

    let t0 = Instant::now();
    let echo = thread::Builder::new()
        .name("xpu-echo".into())
        .spawn(move || -> xpu_sched::Result<u32> {
            let mut echoed = 0;
            while echoed < messages {
                match peer_rx.receive()? {
                    Some(p) => {
                        peer_tx.send(Payload::dec_ref(0, 0, p.lparam));
                        echoed += 1;
                    }
                    None => {
                        peer_rx.doorbell().wait_timeout(Duration::from_millis(10));
                    }
                }
            }
            Ok(echoed)
        })?;

    // The host side never blocks, so the echo thread can always drain.
    let mut received = 0u32;
    let mut sent = 0u32;
    while received < messages {
        let mut progressed = false;
        if sent < messages {
            #[allow(clippy::cast_possible_truncation)]
            let tag = sent as u16;
            if tx.try_send(Payload::dec_ref(0, 0, tag)).is_ok() {
                sent += 1;
                progressed = true;
            }
        }
        while let Some(p) = rx.receive()? {
            #[allow(clippy::cast_possible_truncation)]
            let expected = received as u16;
            if p.lparam != expected {
                bail!("out of order: got {} expected {}", p.lparam, expected);
            }
            received += 1;
            progressed = true;
        }
        if !progressed {
            rx.doorbell().wait_timeout(Duration::from_millis(1));
        }
    }

    let echoed = echo
        .join()
        .map_err(|_| anyhow::anyhow!("echo thread panicked"))??;
    let elapsed = t0.elapsed();
    println!(
        "  {} round trips in {:.1} ms ({:.2} Mmsg/s each way)",
        echoed,
        elapsed.as_secs_f64() * 1e3,
        f64::from(echoed) / elapsed.as_secs_f64() / 1e6
    );
    Ok(())
}
