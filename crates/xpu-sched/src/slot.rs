//! Pipeline slot ownership
//!
//! Each of the two slots has one atomic word naming its occupant and how far
//! along it is. Every transition is a compare-exchange from an exact prior
//! value, so when the done message and the watchdog race for the same frame
//! exactly one of them moves `Sent(f)` to `Completing(f)`.
//!
//! ```text
//!  63..62   61..32        31..0
//! ┌───────┬─────────────┬─────────┐
//! │ state │ generation  │  index  │
//! └───────┴─────────────┴─────────┘
//! ```

use crate::frame::FrameId;
use std::sync::atomic::{AtomicU64, Ordering};

const STATE_SHIFT: u32 = 62;
const GEN_SHIFT: u32 = 32;
const EMPTY: u64 = 0;
const SENT: u64 = 1;
const COMPLETING: u64 = 2;

/// Decoded slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No frame
    Empty,
    /// Frame handed to the remote cores
    Sent(FrameId),
    /// Completion claimed; the slot frees once the completion worker is done
    Completing(FrameId),
}

impl SlotState {
    /// Occupying frame, if any
    pub const fn frame(self) -> Option<FrameId> {
        match self {
            Self::Empty => None,
            Self::Sent(f) | Self::Completing(f) => Some(f),
        }
    }
}

/// Single-word ownership token for one slot
#[derive(Debug, Default)]
pub struct SlotOwner {
    word: AtomicU64,
}

fn encode(state: u64, id: FrameId) -> u64 {
    (state << STATE_SHIFT)
        | (u64::from(id.generation & FrameId::GENERATION_MASK) << GEN_SHIFT)
        | u64::from(id.index)
}

fn decode(word: u64) -> SlotState {
    #[allow(clippy::cast_possible_truncation)]
    let id = FrameId {
        index: word as u32,
        generation: ((word >> GEN_SHIFT) as u32) & FrameId::GENERATION_MASK,
    };
    match word >> STATE_SHIFT {
        SENT => SlotState::Sent(id),
        COMPLETING => SlotState::Completing(id),
        _ => SlotState::Empty,
    }
}

impl SlotOwner {
    /// Empty slot
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(EMPTY),
        }
    }

    /// Current state
    pub fn state(&self) -> SlotState {
        decode(self.word.load(Ordering::Acquire))
    }

    /// Whether the slot can take a frame
    pub fn is_free(&self) -> bool {
        self.word.load(Ordering::Acquire) == EMPTY
    }

    fn transition(&self, from: u64, to: u64) -> bool {
        self.word
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Empty → Sent(id)`
    pub fn claim(&self, id: FrameId) -> bool {
        self.transition(EMPTY, encode(SENT, id))
    }

    /// `Sent(id) → Completing(id)`; the winner owns completion
    pub fn begin_completion(&self, id: FrameId) -> bool {
        self.transition(encode(SENT, id), encode(COMPLETING, id))
    }

    /// `Completing(id) → Empty`
    pub fn release(&self, id: FrameId) -> bool {
        self.transition(encode(COMPLETING, id), EMPTY)
    }
}
