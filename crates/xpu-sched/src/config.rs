//! Scheduler configuration
//!
//! Plain data with builder-style setters. Environment overrides:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `XPU_WATCHDOG_MS` | `watchdog` |
//! | `XPU_FIFO_SLOTS` | `host_fifo_slots` |
//! | `XPU_EVENT_CACHE` | `event_cache` |

use std::time::Duration;
use tracing::{debug, warn};
use xpu_proto::limits::{
    EVENT_CACHE_DEFAULT, HOST_FIFO_SLOTS, REMOTE_FIFO_SLOTS, WATCHDOG_DEFAULT_MS,
};
use xpu_proto::op::OP_TYPE_COUNT;
use xpu_proto::OpType;

/// Injected misbehaviour of a software remote core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreFaults {
    /// Never report `FrameDone`
    pub hang: bool,
    /// Report operator completions with an index outside the model
    pub corrupt_op: bool,
}

/// One remote execution context and the engines it drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSpec {
    /// Name used in logs and thread names
    pub name: String,
    /// Engine types owned by this core
    pub engines: Vec<OpType>,
    /// Injected faults
    pub faults: CoreFaults,
}

impl CoreSpec {
    /// Core owning the given engine types
    pub fn new(name: impl Into<String>, engines: impl Into<Vec<OpType>>) -> Self {
        Self {
            name: name.into(),
            engines: engines.into(),
            faults: CoreFaults::default(),
        }
    }

    /// Never report frame completion
    #[must_use]
    pub const fn hanging(mut self) -> Self {
        self.faults.hang = true;
        self
    }

    /// Report out-of-range operator indices
    #[must_use]
    pub const fn corrupting(mut self) -> Self {
        self.faults.corrupt_op = true;
        self
    }

    /// Whether this core drives `ty`
    pub fn owns(&self, ty: OpType) -> bool {
        self.engines.contains(&ty)
    }
}

/// Default layout: one core for the streaming engines, one for the DSP
pub fn default_cores() -> Vec<CoreSpec> {
    vec![
        CoreSpec::new("main", [OpType::Dma, OpType::Conv, OpType::Pdp, OpType::Rubik]),
        CoreSpec::new("dsp", [OpType::Dsp]),
    ]
}

/// Which core drives each engine type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMap([Option<usize>; OP_TYPE_COUNT]);

impl EngineMap {
    /// First core listing each engine wins
    pub fn from_cores(cores: &[CoreSpec]) -> Self {
        let mut map = [None; OP_TYPE_COUNT];
        for ty in OpType::ALL {
            map[ty.index()] = cores.iter().position(|c| c.owns(ty));
        }
        Self(map)
    }

    /// Core driving `ty`
    pub const fn owner(&self, ty: OpType) -> Option<usize> {
        self.0[ty.index()]
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Per-slot watchdog timeout
    pub watchdog: Duration,

    /// Ring slots reserved by the host side of each channel
    pub host_fifo_slots: usize,

    /// Ring slots reserved by the remote side of each channel
    pub remote_fifo_slots: usize,

    /// Event sink cache capacity per executor
    pub event_cache: usize,

    /// Spin rounds before a full-ring send starts yielding
    pub send_spin_rounds: u32,

    /// Ask the remote side to capture statistics for every frame
    pub capture_stats: bool,

    /// Remote cores and their engines
    pub cores: Vec<CoreSpec>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_millis(WATCHDOG_DEFAULT_MS),
            host_fifo_slots: HOST_FIFO_SLOTS,
            remote_fifo_slots: REMOTE_FIFO_SLOTS,
            event_cache: EVENT_CACHE_DEFAULT,
            send_spin_rounds: 10,
            capture_stats: false,
            cores: default_cores(),
        }
    }
}

impl SchedConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_number::<u64>("XPU_WATCHDOG_MS") {
            config.watchdog = Duration::from_millis(ms);
        }
        if let Some(slots) = env_number::<usize>("XPU_FIFO_SLOTS") {
            config.host_fifo_slots = slots;
        }
        if let Some(cap) = env_number::<usize>("XPU_EVENT_CACHE") {
            config.event_cache = cap;
        }
        debug!(
            "Scheduler config: watchdog={:?}, fifo={}/{}, event_cache={}",
            config.watchdog, config.host_fifo_slots, config.remote_fifo_slots, config.event_cache
        );
        config
    }

    /// Set the watchdog timeout
    #[must_use]
    pub const fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog = timeout;
        self
    }

    /// Set reserved ring slots for both sides
    #[must_use]
    pub const fn with_fifo_slots(mut self, host: usize, remote: usize) -> Self {
        self.host_fifo_slots = host;
        self.remote_fifo_slots = remote;
        self
    }

    /// Set the event sink cache capacity
    #[must_use]
    pub const fn with_event_cache(mut self, capacity: usize) -> Self {
        self.event_cache = capacity;
        self
    }

    /// Request statistics capture for every frame
    #[must_use]
    pub const fn with_capture_stats(mut self, enabled: bool) -> Self {
        self.capture_stats = enabled;
        self
    }

    /// Replace the remote core layout
    #[must_use]
    pub fn with_cores(mut self, cores: Vec<CoreSpec>) -> Self {
        self.cores = cores;
        self
    }

    /// Index of the core that drives `ty`
    pub fn owner_of(&self, ty: OpType) -> Option<usize> {
        self.engine_map().owner(ty)
    }

    /// Engine ownership for the configured cores
    pub fn engine_map(&self) -> EngineMap {
        EngineMap::from_cores(&self.cores)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {name}={raw:?}: not a number");
            None
        }
    }
}
