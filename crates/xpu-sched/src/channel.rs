//! Fixed-capacity message channel between two execution contexts
//!
//! Each direction is a single-producer/single-consumer ring in a
//! [`SharedRegion`]. The two rings of a pair reference each other through a
//! relative `peer` offset in their headers, which is how the sending side
//! finds the ring it writes into.
//!
//! ```text
//! ring header (16 bytes)             payload ring
//! ┌──────────┬──────────┬───────────┬──────────┬──────┬──────┬─────┐
//! │ produce  │ consume  │ fifo_size │ peer off │ w[0] │ w[1] │ ... │
//! └──────────┴──────────┴───────────┴──────────┴──────┴──────┴─────┘
//! ```
//!
//! Only the two free-running indices decide fullness and emptiness:
//! `produce - consume` is the fill level and never exceeds `fifo_size`.
//! Slots are addressed with `index & (fifo_size - 1)`.
//!
//! Ordering: the payload word is stored before `produce` is published with
//! release ordering, then a full fence precedes the doorbell. The receiver
//! loads `produce` with acquire ordering before reading the word and
//! publishes `consume` with release ordering after copying it out.

use crate::doorbell::Doorbell;
use crate::error::{Result, SchedError};
use crate::shm::SharedRegion;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use xpu_proto::limits::fifo_size;
use xpu_proto::Payload;

// ── Ring layout ──────────────────────────────────────────────────────────────

const PRODUCE: usize = 0x0;
const CONSUME: usize = 0x4;
const FIFO_SIZE: usize = 0x8;
const PEER: usize = 0xC;
const HEADER_BYTES: usize = 0x10;

/// One direction of a channel, located by its byte offset in the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ring {
    base: usize,
}

impl Ring {
    const fn bytes(fifo: usize) -> usize {
        HEADER_BYTES + fifo * 4
    }

    fn produce<'r>(&self, region: &'r SharedRegion) -> &'r AtomicU32 {
        region.word(self.base + PRODUCE)
    }

    fn consume<'r>(&self, region: &'r SharedRegion) -> &'r AtomicU32 {
        region.word(self.base + CONSUME)
    }

    fn slot<'r>(&self, region: &'r SharedRegion, index: u32, mask: u32) -> &'r AtomicU32 {
        region.word(self.base + HEADER_BYTES + ((index & mask) as usize) * 4)
    }

    fn fifo_size(&self, region: &SharedRegion) -> u32 {
        region.word(self.base + FIFO_SIZE).load(Ordering::Acquire)
    }

    /// Follow the relative peer offset stored in the header.
    fn peer(&self, region: &SharedRegion) -> Ring {
        #[allow(clippy::cast_possible_wrap)]
        let offset = region.word(self.base + PEER).load(Ordering::Acquire) as i32;
        Ring {
            base: self.base.wrapping_add_signed(offset as isize),
        }
    }

    fn init(&self, region: &SharedRegion, fifo: u32, peer: Ring) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let offset = (peer.base as isize - self.base as isize) as i32;
        region.word(self.base + PRODUCE).store(0, Ordering::Relaxed);
        region.word(self.base + CONSUME).store(0, Ordering::Relaxed);
        region.word(self.base + FIFO_SIZE).store(fifo, Ordering::Relaxed);
        #[allow(clippy::cast_sign_loss)]
        region.word(self.base + PEER).store(offset as u32, Ordering::Release);
    }
}

// ── Wait strategy ────────────────────────────────────────────────────────────

/// Marker for wait strategies that never block in the OS.
///
/// A context that has just written a payload for a peer and is waiting for
/// ring space may spin or yield but must not sleep on an OS primitive: on
/// the firmware side there is no scheduler to wake it. Channel sends only
/// accept strategies carrying this marker.
pub trait NonBlocking {}

/// Something that can be called repeatedly while waiting for a condition
pub trait SpinWait {
    /// One wait step
    fn snooze(&mut self);
}

/// Bounded spin, then yield
///
/// The first `spin_rounds` snoozes issue exponentially more spin-loop hints
/// (capped at 64 per round); after that every snooze is a thread yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    spin_rounds: u32,
    step: u32,
}

impl Backoff {
    /// Create a backoff that spins for `spin_rounds` snoozes before yielding
    pub const fn new(spin_rounds: u32) -> Self {
        Self {
            spin_rounds,
            step: 0,
        }
    }

    /// Restart from the spinning phase
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Whether the spinning phase is over
    pub const fn is_yielding(&self) -> bool {
        self.step >= self.spin_rounds
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(10)
    }
}

impl SpinWait for Backoff {
    fn snooze(&mut self) {
        if self.step < self.spin_rounds {
            for _ in 0..(1u32 << self.step.min(6)) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }
}

impl NonBlocking for Backoff {}

// ── Endpoints ────────────────────────────────────────────────────────────────

/// One side of a channel pair
#[derive(Debug)]
pub struct Endpoint {
    region: Arc<SharedRegion>,
    inbox: Ring,
    inbox_bell: Arc<Doorbell>,
    peer_bell: Arc<Doorbell>,
    fifo: u32,
}

/// Build a connected channel pair
///
/// The ring size is `max(local_slots, peer_slots)` rounded up to a power of
/// two and never changes afterwards. `local_bell` is rung when the peer
/// sends to the local side and vice versa.
///
/// # Errors
///
/// Returns an error if the shared region cannot be mapped or the requested
/// size does not fit the 32-bit ring header.
pub fn channel_pair(
    local_slots: usize,
    peer_slots: usize,
    local_bell: Arc<Doorbell>,
    peer_bell: Arc<Doorbell>,
) -> Result<(Endpoint, Endpoint)> {
    let fifo = fifo_size(local_slots, peer_slots);
    let fifo_u32 = u32::try_from(fifo)
        .ok()
        .filter(|f| *f <= 1 << 30)
        .ok_or_else(|| SchedError::exhausted("channel fifo", 1 << 30))?;

    let ring_bytes = Ring::bytes(fifo);
    let region = Arc::new(SharedRegion::map(ring_bytes * 2)?);
    let local = Ring { base: 0 };
    let peer = Ring { base: ring_bytes };
    local.init(&region, fifo_u32, peer);
    peer.init(&region, fifo_u32, local);

    debug!("Channel pair: fifo_size={fifo} (local {local_slots}, peer {peer_slots})");

    let a = Endpoint {
        region: Arc::clone(&region),
        inbox: local,
        inbox_bell: Arc::clone(&local_bell),
        peer_bell: Arc::clone(&peer_bell),
        fifo: fifo_u32,
    };
    let b = Endpoint {
        region,
        inbox: peer,
        inbox_bell: peer_bell,
        peer_bell: local_bell,
        fifo: fifo_u32,
    };
    Ok((a, b))
}

impl Endpoint {
    /// Ring capacity
    pub const fn fifo_size(&self) -> usize {
        self.fifo as usize
    }

    /// Split into the sending and receiving halves
    pub fn split(self) -> (Sender, Receiver) {
        let outbox = self.inbox.peer(&self.region);
        let fifo = outbox.fifo_size(&self.region);
        let sender = Sender {
            region: Arc::clone(&self.region),
            ring: outbox,
            mask: fifo - 1,
            fifo,
            bell: self.peer_bell,
            backoff: Backoff::default(),
            saturated: 0,
        };
        let receiver = Receiver {
            region: self.region,
            ring: self.inbox,
            mask: self.fifo - 1,
            bell: self.inbox_bell,
        };
        (sender, receiver)
    }
}

/// Sending half: writes into the peer's ring
#[derive(Debug)]
pub struct Sender {
    region: Arc<SharedRegion>,
    ring: Ring,
    mask: u32,
    fifo: u32,
    bell: Arc<Doorbell>,
    backoff: Backoff,
    saturated: u64,
}

impl Sender {
    /// Use a different spin budget while the ring is full
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send a payload, busy-waiting while the ring is full
    ///
    /// There is no timeout: an unresponsive peer stalls the caller, and
    /// liveness is the frame watchdog's job. Callers must not hold locks the
    /// receiving side needs.
    pub fn send(&mut self, payload: Payload) {
        let mut backoff = self.backoff;
        backoff.reset();
        let produce = self.wait_for_space(&mut backoff);
        self.publish(produce, payload);
    }

    /// Send a payload if there is room
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ChannelFull`] when the ring is full.
    pub fn try_send(&mut self, payload: Payload) -> Result<()> {
        let produce = self.ring.produce(&self.region).load(Ordering::Relaxed);
        let consume = self.ring.consume(&self.region).load(Ordering::Acquire);
        if produce.wrapping_sub(consume) >= self.fifo {
            return Err(SchedError::ChannelFull {
                fifo_size: self.fifo as usize,
            });
        }
        self.publish(produce, payload);
        Ok(())
    }

    fn wait_for_space<W: SpinWait + NonBlocking>(&mut self, wait: &mut W) -> u32 {
        let produce = self.ring.produce(&self.region).load(Ordering::Relaxed);
        let mut reported = false;
        loop {
            let consume = self.ring.consume(&self.region).load(Ordering::Acquire);
            if produce.wrapping_sub(consume) < self.fifo {
                return produce;
            }
            if !reported {
                self.saturated += 1;
                trace!("Channel full ({} slots), waiting for peer", self.fifo);
                reported = true;
            }
            wait.snooze();
        }
    }

    fn publish(&mut self, produce: u32, payload: Payload) {
        self.ring
            .slot(&self.region, produce, self.mask)
            .store(payload.to_word(), Ordering::Relaxed);
        self.ring
            .produce(&self.region)
            .store(produce.wrapping_add(1), Ordering::Release);
        fence(Ordering::SeqCst);
        self.bell.ring();
    }

    /// Messages written but not yet consumed by the peer
    pub fn in_flight(&self) -> usize {
        let produce = self.ring.produce(&self.region).load(Ordering::Relaxed);
        let consume = self.ring.consume(&self.region).load(Ordering::Acquire);
        produce.wrapping_sub(consume) as usize
    }

    /// Times a send found the ring full
    pub const fn saturation_count(&self) -> u64 {
        self.saturated
    }

    /// Ring capacity
    pub const fn fifo_size(&self) -> usize {
        self.fifo as usize
    }
}

/// Receiving half: drains the local ring
#[derive(Debug)]
pub struct Receiver {
    region: Arc<SharedRegion>,
    ring: Ring,
    mask: u32,
    bell: Arc<Doorbell>,
}

impl Receiver {
    /// Take the next message, or `None` if the ring is empty
    ///
    /// # Errors
    ///
    /// Returns a decode error for a malformed word. The word is consumed
    /// either way so one bad message cannot wedge the ring.
    pub fn receive(&mut self) -> Result<Option<Payload>> {
        match self.receive_raw() {
            Some(word) => Ok(Some(Payload::from_word(word)?)),
            None => Ok(None),
        }
    }

    /// Take the next undecoded word, or `None` if the ring is empty
    pub fn receive_raw(&mut self) -> Option<u32> {
        let consume = self.ring.consume(&self.region).load(Ordering::Relaxed);
        let produce = self.ring.produce(&self.region).load(Ordering::Acquire);
        if produce == consume {
            return None;
        }
        let word = self
            .ring
            .slot(&self.region, consume, self.mask)
            .load(Ordering::Relaxed);
        self.ring
            .consume(&self.region)
            .store(consume.wrapping_add(1), Ordering::Release);
        Some(word)
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        let consume = self.ring.consume(&self.region).load(Ordering::Relaxed);
        self.ring.produce(&self.region).load(Ordering::Acquire) == consume
    }

    /// Doorbell rung by the peer after each send
    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.bell
    }
}
