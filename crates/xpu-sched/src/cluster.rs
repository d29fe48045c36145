//! Host plus software remote cores, wired together
//!
//! ```text
//!             ┌──────────── host ────────────┐
//! submit ───► │ SchedulerContext             │ ──ring──► core "main"
//!             │   ▲ irq thread  (receive)    │ ◄─ring─── (Dma Conv Pdp Rubik)
//!             │   │ watchdog thread          │
//!             │   │ completion worker        │ ──ring──► core "dsp"
//!             └──────────────────────────────┘ ◄─ring─── (Dsp)
//! ```
//!
//! All host rings share one doorbell, standing in for the single interrupt
//! line the remote cores raise.

use crate::channel::{channel_pair, Backoff, Receiver};
use crate::completion::run_completion_worker;
use crate::config::SchedConfig;
use crate::descriptor::SlotTable;
use crate::doorbell::Doorbell;
use crate::error::{Result, SchedError};
use crate::executor::Executor;
use crate::graph::OperatorGraph;
use crate::outbox::Outbox;
use crate::program::{BufferBinder, EnvelopeEncoder, ProgramEncoder, SoftwareBinder};
use crate::remote::SoftwareCore;
use crate::scheduler::SchedulerContext;
use crate::stats::StatsSnapshot;
use crate::watchdog::Expiry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

const IRQ_IDLE_WAIT: Duration = Duration::from_millis(20);
const IRQ_BACKLOG_WAIT: Duration = Duration::from_millis(1);

/// A running scheduler with its software remote cores
#[derive(Debug)]
pub struct Cluster {
    sched: Arc<SchedulerContext>,
    host_stop: Arc<AtomicBool>,
    irq_stop: Arc<AtomicBool>,
    core_stop: Arc<AtomicBool>,
    host_bell: Arc<Doorbell>,
    core_bells: Vec<Arc<Doorbell>>,
    host_threads: Vec<JoinHandle<()>>,
    irq_thread: Option<JoinHandle<()>>,
    core_threads: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Spawn with the software binder and envelope encoder
    ///
    /// # Errors
    ///
    /// Returns an error if no core is configured, a channel cannot be
    /// mapped, or a thread cannot be spawned.
    pub fn spawn(config: SchedConfig) -> Result<Self> {
        Self::spawn_with(config, Arc::new(SoftwareBinder::new()), Arc::new(EnvelopeEncoder))
    }

    /// Spawn with explicit collaborators
    ///
    /// # Errors
    ///
    /// See [`spawn`](Self::spawn).
    pub fn spawn_with(
        config: SchedConfig,
        binder: Arc<dyn BufferBinder>,
        encoder: Arc<dyn ProgramEncoder>,
    ) -> Result<Self> {
        if config.cores.is_empty() {
            return Err(SchedError::invalid_state("cluster needs at least one remote core"));
        }

        let host_bell = Arc::new(Doorbell::new());
        let descriptors = Arc::new(SlotTable::new());
        let engines = config.engine_map();

        let mut outboxes = Vec::with_capacity(config.cores.len());
        let mut receivers = Vec::with_capacity(config.cores.len());
        let mut cores = Vec::with_capacity(config.cores.len());
        let mut core_bells = Vec::with_capacity(config.cores.len());
        for (index, spec) in config.cores.iter().enumerate() {
            let core_bell = Arc::new(Doorbell::new());
            let (host_end, core_end) = channel_pair(
                config.host_fifo_slots,
                config.remote_fifo_slots,
                Arc::clone(&host_bell),
                Arc::clone(&core_bell),
            )?;
            let (tx, rx) = host_end.split();
            let tx = tx.with_backoff(Backoff::new(config.send_spin_rounds));
            outboxes.push(Outbox::new(spec.name.clone(), tx, Arc::clone(&host_bell)));
            receivers.push(rx);
            cores.push(SoftwareCore::new(
                index,
                spec.clone(),
                engines,
                core_end,
                Arc::clone(&descriptors),
            ));
            core_bells.push(core_bell);
        }

        info!(
            "Spawning cluster: {} cores, watchdog {:?}",
            config.cores.len(),
            config.watchdog
        );
        let sched = Arc::new(SchedulerContext::new(config, outboxes, descriptors, binder, encoder));
        let mut cluster = Self {
            sched,
            host_stop: Arc::new(AtomicBool::new(false)),
            irq_stop: Arc::new(AtomicBool::new(false)),
            core_stop: Arc::new(AtomicBool::new(false)),
            host_bell,
            core_bells,
            host_threads: Vec::new(),
            irq_thread: None,
            core_threads: Vec::new(),
        };
        // On a spawn failure, dropping the half-built cluster stops what started.
        cluster.start(cores, receivers)?;
        Ok(cluster)
    }

    fn start(&mut self, cores: Vec<SoftwareCore>, receivers: Vec<Receiver>) -> Result<()> {
        for core in cores {
            let stop = Arc::clone(&self.core_stop);
            let handle = thread::Builder::new()
                .name(format!("xpu-core-{}", core.name()))
                .spawn(move || core.run(&stop))?;
            self.core_threads.push(handle);
        }

        let sched = Arc::clone(&self.sched);
        let stop = Arc::clone(&self.irq_stop);
        let bell = Arc::clone(&self.host_bell);
        self.irq_thread = Some(
            thread::Builder::new()
                .name("xpu-irq".into())
                .spawn(move || host_irq_loop(&sched, receivers, &bell, &stop))?,
        );

        let sched = Arc::clone(&self.sched);
        let stop = Arc::clone(&self.host_stop);
        self.host_threads.push(
            thread::Builder::new()
                .name("xpu-complete".into())
                .spawn(move || run_completion_worker(&sched, &stop))?,
        );

        let sched = Arc::clone(&self.sched);
        self.host_threads.push(
            thread::Builder::new()
                .name("xpu-watchdog".into())
                .spawn(move || watchdog_loop(&sched))?,
        );
        Ok(())
    }

    /// Scheduler context
    pub const fn scheduler(&self) -> &Arc<SchedulerContext> {
        &self.sched
    }

    /// Load a model
    ///
    /// # Errors
    ///
    /// See [`SchedulerContext::load`].
    pub fn load(&self, graph: &OperatorGraph) -> Result<Executor> {
        self.sched.load(graph)
    }

    /// Scheduler counters
    pub fn stats(&self) -> StatsSnapshot {
        self.sched.stats()
    }

    /// Stop every thread and fail frames that did not finish
    ///
    /// Admission stops first; the host keeps draining while the completion
    /// worker and the cores wind down, so no sender is left spinning on a
    /// ring nobody reads.
    pub fn shutdown(&mut self) {
        if self.irq_thread.is_none() && self.core_threads.is_empty() {
            return;
        }
        info!("Shutting down cluster");
        self.sched.close();

        self.host_stop.store(true, Ordering::Release);
        self.sched.completions().wake();
        join_all(self.host_threads.drain(..));

        self.core_stop.store(true, Ordering::Release);
        for bell in &self.core_bells {
            bell.ring();
        }
        join_all(self.core_threads.drain(..));

        self.irq_stop.store(true, Ordering::Release);
        self.host_bell.ring();
        join_all(self.irq_thread.take());

        self.sched.fail_outstanding();
        debug!("Cluster stopped: {:?}", self.sched.stats());
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("?").to_owned();
        if handle.join().is_err() {
            error!("Thread {name} panicked");
        }
    }
}

/// Host receive loop: the interrupt handler
///
/// Drains every core's ring, then pushes parked host messages. It never
/// waits for ring space, so the cores can always make progress.
fn host_irq_loop(
    sched: &SchedulerContext,
    mut receivers: Vec<Receiver>,
    bell: &Doorbell,
    stop: &AtomicBool,
) {
    debug!("Host receive loop started for {} cores", receivers.len());
    while !stop.load(Ordering::Acquire) {
        let mut busy = false;
        for (core, rx) in receivers.iter_mut().enumerate() {
            while let Some(word) = rx.receive_raw() {
                busy = true;
                sched.handle_message(core, word);
            }
        }
        let backlog = sched.flush_outboxes();
        if !busy {
            bell.wait_timeout(if backlog { IRQ_BACKLOG_WAIT } else { IRQ_IDLE_WAIT });
        }
    }
    debug!("Host receive loop stopped");
}

fn watchdog_loop(sched: &SchedulerContext) {
    loop {
        match sched.watchdog().next_expiry() {
            Expiry::Expired { slot, frame } => sched.on_watchdog(slot, frame),
            Expiry::Stopped => break,
        }
    }
    debug!("Watchdog stopped");
}
