//! Fixed limits shared by host and firmware.
//!
//! The firmware allocates nothing at runtime, so every list it walks has a
//! compile-time bound. Changing any of these requires rebuilding both sides.

use crate::op::OP_TYPE_COUNT;

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Pipeline slots ("tiktok"): one frame executes while the next is prepared.
pub const TIKTOK_SLOTS: usize = 2;

/// Width of the frame sequence tag carried in slot-scoped messages.
pub const SEQ_BITS: u32 = 4;

// ── Dependency counters ──────────────────────────────────────────────────────

/// Bits per dependency counter.
pub const COUNTER_BITS: u32 = 4;

/// Largest representable counter value.
pub const COUNTER_MAX: u8 = (1 << COUNTER_BITS) - 1;

/// Counters packed per byte.
pub const COUNTERS_PER_BYTE: usize = 2;

/// Bytes needed for `ops` packed counters.
#[must_use]
pub const fn counter_bytes(ops: usize) -> usize {
    ops.div_ceil(COUNTERS_PER_BYTE)
}

// ── Operator lists ───────────────────────────────────────────────────────────

/// Completion consumers one producer can notify directly.
pub const MAX_COMPLETION_CONSUMERS: usize = OP_TYPE_COUNT;

/// Consumers a convolution producer can reach through its broadcast header.
pub const CONV_BROADCAST_MAX: usize = 16;

/// Largest operator index that fits in a message long-param.
pub const MAX_OPS: usize = u16::MAX as usize;

// ── Events ───────────────────────────────────────────────────────────────────

/// Operators that may be marked pause-on-completion at once.
pub const MAX_PAUSE_OPS: usize = 32;

/// Default capacity of the per-context event sink cache.
pub const EVENT_CACHE_DEFAULT: usize = 64;

// ── Channels ─────────────────────────────────────────────────────────────────

/// Default reserved ring slots on the host side of a channel.
pub const HOST_FIFO_SLOTS: usize = 64;

/// Default reserved ring slots on the remote side of a channel.
pub const REMOTE_FIFO_SLOTS: usize = 32;

/// Ring size for a channel pair: the larger reservation, rounded up to a
/// power of two so wrap-around is a mask.
#[must_use]
pub const fn fifo_size(local_slots: usize, peer_slots: usize) -> usize {
    let wanted = if local_slots > peer_slots { local_slots } else { peer_slots };
    if wanted == 0 {
        1
    } else {
        wanted.next_power_of_two()
    }
}

// ── Watchdog ─────────────────────────────────────────────────────────────────

/// Default per-slot watchdog timeout (5 minutes).
pub const WATCHDOG_DEFAULT_MS: u64 = 5 * 60 * 1000;
