//! Channel throughput across ring sizes.
//!
//! One thread echoes every message back; the host keeps the ring as full as
//! it can and counts round trips. Smaller rings saturate sooner and spend
//! more time in the sender's backoff.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xpu_proto::Payload;
use xpu_sched::channel_pair;
use xpu_sched::doorbell::Doorbell;

const MESSAGES: u32 = 200_000;
const SIZES: [usize; 5] = [4, 16, 64, 256, 1024];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    println!("Channel round-trip throughput ({MESSAGES} messages each way)");
    println!("==========================================================");
    println!();
    println!("  {:>6}  {:>10}  {:>12}  {:>10}", "fifo", "ms", "Mmsg/s", "ns/trip");
    println!("  {:-<6}  {:-<10}  {:-<12}  {:-<10}", "", "", "", "");

    for slots in SIZES {
        info!("Ring of {} reserved slots, {} messages", slots, MESSAGES);
        let (fifo, elapsed) = round_trips(slots, MESSAGES)?;
        let secs = elapsed.as_secs_f64();
        println!(
            "  {:>6}  {:>10.1}  {:>12.2}  {:>10.0}",
            fifo,
            secs * 1e3,
            f64::from(MESSAGES) / secs / 1e6,
            secs * 1e9 / f64::from(MESSAGES)
        );
    }

    Ok(())
}

fn round_trips(slots: usize, messages: u32) -> Result<(usize, Duration)> {
    let host_bell = Arc::new(Doorbell::new());
    let peer_bell = Arc::new(Doorbell::new());
    let (host, peer) = channel_pair(slots, slots, host_bell, peer_bell)?;
    let fifo = host.fifo_size();
    let (mut tx, mut rx) = host.split();
    let (mut peer_tx, mut peer_rx) = peer.split();

    let t0 = Instant::now();
    let echo = thread::Builder::new()
        .name("bench-echo".into())
        .spawn(move || -> xpu_sched::Result<()> {
            let mut echoed = 0;
            while echoed < messages {
                if let Some(p) = peer_rx.receive()? {
                    peer_tx.send(p);
                    echoed += 1;
                } else {
                    peer_rx.doorbell().wait_timeout(Duration::from_millis(10));
                }
            }
            Ok(())
        })?;

    let mut sent = 0u32;
    let mut received = 0u32;
    while received < messages {
        if sent < messages {
            #[allow(clippy::cast_possible_truncation)]
            let tag = sent as u16;
            if tx.try_send(Payload::dec_ref(0, 0, tag)).is_ok() {
                sent += 1;
            }
        }
        while let Some(p) = rx.receive()? {
            #[allow(clippy::cast_possible_truncation)]
            let expected = received as u16;
            if p.lparam != expected {
                bail!("fifo {fifo}: got {} expected {}", p.lparam, expected);
            }
            received += 1;
        }
    }
    let elapsed = t0.elapsed();

    echo.join()
        .map_err(|_| anyhow::anyhow!("echo thread panicked"))??;
    Ok((fifo, elapsed))
}
