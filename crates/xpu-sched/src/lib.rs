//! Two-slot frame scheduler for accelerator clusters.
//!
//! Runs inference frames over a set of fixed-function engines (DMA,
//! convolution, post-processing, reshape, DSP) that are driven by remote
//! control cores. The host and each core talk through a pair of
//! shared-memory rings carrying 4-byte messages; the only synchronisation is
//! write, barrier, doorbell.
//!
//! # Pipeline
//!
//! ```text
//!   OperatorGraph ──resolve──► ResolvedModel ──encode/bind──► Executor
//!                                                                │ submit
//!                                                                ▼
//!   slot 0 ┌───────────┐     FrameReady      ┌─────────────┐
//!   slot 1 │ Scheduler │ ──────────────────► │ remote core │ walks per-engine
//!          │  (2 max)  │ ◄────────────────── │  (SlotRun)  │ sequences, 4-bit
//!          └───────────┘ FrameDone / DecRef  └─────────────┘ counters
//!                │ watchdog / done race for the slot token
//!                ▼
//!          completion worker ──► FrameOutcome
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use xpu_sched::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let cluster = Cluster::spawn(SchedConfig::from_env())?;
//! let graph = OperatorGraph::chain(&[OpType::Dma, OpType::Conv, OpType::Dma]);
//! let exec = cluster.load(&graph)?;
//!
//! let io = IoBindings::single(TensorHandle::new(1, 4096), TensorHandle::new(2, 4096));
//! let outcome = exec.submit(io)?.wait();
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`shm`], [`doorbell`], [`channel`] | Shared ring transport |
//! | [`graph`], [`resolver`], [`counters`] | Compiled graph and dependency resolution |
//! | [`program`] | Program encoding and buffer binding collaborators |
//! | [`scheduler`], [`slot`], [`watchdog`], [`completion`] | Two-slot frame scheduling |
//! | [`executor`], [`events`] | Loaded models, pause/resume, event sources and sinks |
//! | [`remote`] | Software remote cores |
//! | [`cluster`] | Everything wired together with threads |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod channel;
pub mod cluster;
pub mod completion;
pub mod config;
pub mod counters;
pub mod descriptor;
pub mod doorbell;
mod error;
pub mod events;
pub mod executor;
pub mod frame;
pub mod graph;
pub mod outbox;
pub mod program;
pub mod remote;
pub mod resolver;
pub mod scheduler;
pub mod shm;
pub mod slot;
mod stats;
pub mod watchdog;

pub use channel::{channel_pair, Backoff, Endpoint, Receiver, Sender};
pub use cluster::Cluster;
pub use config::{default_cores, CoreFaults, CoreSpec, EngineMap, SchedConfig};
pub use counters::DepCounters;
pub use error::{Result, SchedError};
pub use events::PauseList;
pub use executor::Executor;
pub use frame::{
    CompletionStatus, FrameHandle, FrameId, FrameOutcome, FrameStats, IoBindings,
};
pub use graph::{EngineConfig, EventRole, Operator, OperatorGraph};
pub use program::{BufferBinder, EnvelopeEncoder, ProgramEncoder, SoftwareBinder, TensorHandle};
pub use resolver::{resolve, ResolvedModel};
pub use scheduler::SchedulerContext;
pub use slot::SlotState;
pub use stats::StatsSnapshot;
pub use xpu_proto::{EdgeKind, MsgType, OpType, Payload};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Cluster, CompletionStatus, CoreSpec, EdgeKind, EventRole, Executor, FrameHandle,
        FrameOutcome, IoBindings, OpType, Operator, OperatorGraph, Result, SchedConfig,
        SchedError, TensorHandle,
    };
}
