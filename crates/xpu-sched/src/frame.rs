//! Frames, their identifiers and their outcome
//!
//! Frames live in a generation-tagged arena owned by the scheduler. A
//! [`FrameId`] that outlived its frame resolves to `None` instead of
//! aliasing whatever reused the entry.

use crate::error::{Result, SchedError};
use crate::program::TensorHandle;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Arena index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    /// Entry index
    pub index: u32,
    /// Entry generation when the frame was inserted
    pub generation: u32,
}

impl FrameId {
    /// Generations wrap within this mask so an id fits the slot owner word
    pub const GENERATION_MASK: u32 = 0x3FFF_FFFF;
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-tagged slab
#[derive(Debug)]
pub struct FrameArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for FrameArena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> FrameArena<T> {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ResourceExhausted`] past `u32::MAX` live entries.
    pub fn insert(&mut self, value: T) -> Result<FrameId> {
        let id = if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            FrameId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = u32::try_from(self.entries.len())
                .map_err(|_| SchedError::exhausted("frame arena", u32::MAX as usize))?;
            self.entries.push(Entry {
                generation: 0,
                value: Some(value),
            });
            FrameId {
                index,
                generation: 0,
            }
        };
        self.len += 1;
        Ok(id)
    }

    /// Live value for `id`
    pub fn get(&self, id: FrameId) -> Option<&T> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_ref())
    }

    /// Live value for `id`, mutably
    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_mut())
    }

    /// Remove and return the value for `id`; the id becomes stale
    pub fn remove(&mut self, id: FrameId) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1) & FrameId::GENERATION_MASK;
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Live entries
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds nothing
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries with their ids
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            #[allow(clippy::cast_possible_truncation)]
            let index = i as u32;
            e.value.as_ref().map(|v| {
                (
                    FrameId {
                        index,
                        generation: e.generation,
                    },
                    v,
                )
            })
        })
    }
}

// ── IO ───────────────────────────────────────────────────────────────────────

/// Buffers a frame reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoBindings {
    /// Input tensors
    pub inputs: Vec<TensorHandle>,
    /// Output tensors
    pub outputs: Vec<TensorHandle>,
}

impl IoBindings {
    /// One input and one output
    pub fn single(input: TensorHandle, output: TensorHandle) -> Self {
        Self {
            inputs: vec![input],
            outputs: vec![output],
        }
    }

    /// All handles, inputs first
    pub fn handles(&self) -> impl Iterator<Item = &TensorHandle> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// Device addresses of a frame's bound buffers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundIo {
    /// Input addresses
    pub inputs: Vec<u64>,
    /// Output addresses
    pub outputs: Vec<u64>,
}

impl BoundIo {
    /// All addresses, inputs first
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }

    /// Address table as published in the frame descriptor
    pub fn address_table(&self) -> Bytes {
        let all: Vec<u64> = self.addresses().collect();
        Bytes::copy_from_slice(bytemuck::cast_slice::<u64, u8>(&all))
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Lifecycle of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Waiting for a pipeline slot
    Queued,
    /// Owned by a slot and running on the remote cores
    Sent,
    /// Completion path has claimed it
    Completing,
    /// Finished
    Done,
}

/// How a frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Every participating core reported done
    Success,
    /// The watchdog expired first
    Timeout,
    /// Protocol violation, binding failure or dead context
    Failed,
}

/// Per-frame statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Time spent waiting for a slot
    pub queued: Duration,
    /// Time from send to completion
    pub execution: Duration,
    /// Time from submit to completion
    pub total: Duration,
    /// Remote cores the frame ran on
    pub cores: usize,
    /// Operators the cores reported complete
    pub ops_completed: u32,
    /// Counters left non-zero at completion (only when capture was requested)
    pub counter_residue: Option<usize>,
}

/// Result of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Terminal status
    pub status: CompletionStatus,
    /// Statistics
    pub stats: FrameStats,
}

impl FrameOutcome {
    /// Whether the frame succeeded
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// Callback run by the completion worker
pub type CompletionCallback = Box<dyn FnOnce(FrameId, &FrameOutcome) + Send>;

/// One-shot outcome cell shared by the completion path and handles
#[derive(Debug, Default)]
pub struct FrameWaiter {
    outcome: Mutex<Option<FrameOutcome>>,
    cond: Condvar,
}

impl FrameWaiter {
    /// Publish the outcome; later calls are ignored
    pub fn resolve(&self, outcome: FrameOutcome) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// Outcome if already resolved
    pub fn peek(&self) -> Option<FrameOutcome> {
        self.outcome.lock().clone()
    }

    /// Block until resolved
    pub fn wait(&self) -> FrameOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Block until resolved or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FrameOutcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            let _ = self.cond.wait_while_for(&mut slot, |o| o.is_none(), timeout);
        }
        slot.clone()
    }
}

/// Caller's reference to a submitted frame
#[derive(Debug, Clone)]
pub struct FrameHandle {
    id: FrameId,
    waiter: Arc<FrameWaiter>,
}

impl FrameHandle {
    pub(crate) const fn new(id: FrameId, waiter: Arc<FrameWaiter>) -> Self {
        Self { id, waiter }
    }

    /// Arena id of the frame
    pub const fn id(&self) -> FrameId {
        self.id
    }

    /// Outcome if the frame has finished
    pub fn try_outcome(&self) -> Option<FrameOutcome> {
        self.waiter.peek()
    }

    /// Block until the frame finishes
    pub fn wait(&self) -> FrameOutcome {
        self.waiter.wait()
    }

    /// Block until the frame finishes or `timeout` elapses
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Timeout`] if the frame is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<FrameOutcome> {
        self.waiter.wait_timeout(timeout).ok_or(SchedError::Timeout {
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_do_not_alias() {
        let mut arena = FrameArena::new();
        let a = arena.insert("a").unwrap();
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b").unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn iter_yields_live_entries() {
        let mut arena = FrameArena::new();
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        arena.remove(a);
        let live: Vec<_> = arena.iter().collect();
        assert_eq!(live, vec![(b, &2)]);
    }

    #[test]
    fn waiter_resolves_once() {
        let waiter = Arc::new(FrameWaiter::default());
        let handle = FrameHandle::new(FrameId { index: 0, generation: 0 }, Arc::clone(&waiter));
        assert!(handle.wait_timeout(Duration::from_millis(1)).is_err());

        let outcome = FrameOutcome {
            status: CompletionStatus::Timeout,
            stats: FrameStats::default(),
        };
        let resolver = {
            let waiter = Arc::clone(&waiter);
            let outcome = outcome.clone();
            std::thread::spawn(move || waiter.resolve(outcome))
        };
        assert_eq!(handle.wait(), outcome);
        assert!(resolver.join().unwrap());
        assert!(!waiter.resolve(FrameOutcome {
            status: CompletionStatus::Success,
            stats: FrameStats::default(),
        }));
        assert_eq!(handle.try_outcome().map(|o| o.status), Some(CompletionStatus::Timeout));
    }

    #[test]
    fn bound_io_table_packs_addresses_in_order() {
        let io = BoundIo {
            inputs: vec![0x1000_0000],
            outputs: vec![0x1000_1000],
        };
        let table = io.address_table();
        assert_eq!(table.len(), 16);
        assert_eq!(&table[..8], &0x1000_0000u64.to_ne_bytes());
    }
}
