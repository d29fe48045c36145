//! Per-slot frame descriptors shared with the remote cores
//!
//! The host publishes a descriptor before it sends `FrameReady` for the
//! slot and clears it before the slot token is released, so a core that
//! sees a descriptor with the sequence tag it was told about is looking at
//! the right frame.

use crate::counters::DepCounters;
use crate::events::PauseList;
use crate::program::ProgramImage;
use crate::resolver::ResolvedModel;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use xpu_proto::limits::TIKTOK_SLOTS;

/// Everything a remote core needs to run one frame
#[derive(Debug)]
pub struct FrameDescriptor {
    /// Sequence tag carried by every message about this frame
    pub seq: u8,
    /// Whether statistics capture was requested
    pub capture: bool,
    /// Resolved graph
    pub model: Arc<ResolvedModel>,
    /// Live counter table for this slot
    pub counters: Arc<DepCounters>,
    /// Engine programs
    pub program: Arc<ProgramImage>,
    /// Operators that pause after completing
    pub pause: PauseList,
    /// Bound input and output addresses
    pub io_table: Bytes,
}

/// Descriptor table, one entry per pipeline slot
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: [RwLock<Option<Arc<FrameDescriptor>>>; TIKTOK_SLOTS],
}

impl SlotTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the descriptor for `slot`
    pub fn publish(&self, slot: usize, descriptor: Arc<FrameDescriptor>) {
        *self.slots[slot].write() = Some(descriptor);
    }

    /// Clear `slot`
    pub fn clear(&self, slot: usize) {
        *self.slots[slot].write() = None;
    }

    /// Descriptor in `slot`, if any
    pub fn get(&self, slot: usize) -> Option<Arc<FrameDescriptor>> {
        self.slots.get(slot)?.read().clone()
    }

    /// Descriptor in `slot` if its sequence tag is `seq`
    pub fn matching(&self, slot: usize, seq: u8) -> Option<Arc<FrameDescriptor>> {
        self.get(slot).filter(|d| d.seq == seq)
    }
}
