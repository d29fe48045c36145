//! Wire protocol model for the host ↔ remote-core frame scheduler.
//!
//! This crate has **no dependencies** and **no hardware access**. It is the
//! shared vocabulary between the host scheduler and the firmware running on
//! the remote cores: message types, the fixed 4-byte payload, param packing,
//! engine kinds and the limits both sides are built against.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`msg`] | `MsgType`, the 4-byte `Payload` codec, slot-scoped param packing |
//! | [`op`] | Engine kinds (`OpType`), dependency edge kinds (`EdgeKind`) |
//! | [`limits`] | Slot count, counter width, list capacities, default FIFO sizes |
//!
//! # Wire format
//!
//! ```text
//!  byte 0      byte 1        bytes 2..3 (LE)
//! ┌─────────┬──────────────┬───────────────────┐
//! │  type   │    param     │    long param     │
//! └─────────┴──────────────┴───────────────────┘
//!             bit 0  slot
//!             bit 1  flag (capture stats / paused)
//!             bits 4..7 frame sequence tag
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod limits;
pub mod msg;
pub mod op;

pub use msg::{DecodeError, MsgType, Payload, SlotParam};
pub use op::{EdgeKind, OpType};
