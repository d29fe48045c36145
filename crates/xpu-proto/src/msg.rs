//! Control messages exchanged over a channel.
//!
//! Every message is exactly four bytes. The layout is shared with the remote
//! firmware and must not change.

use std::fmt;

use crate::limits::TIKTOK_SLOTS;

// ── Message types ────────────────────────────────────────────────────────────

/// Message type (byte 0). At most 16 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Host → core: the descriptor for a slot has been published.
    FrameReady = 1,
    /// Core → host: every operator this core owns in the slot has finished.
    FrameDone = 2,
    /// Core → host: an operator finished (sent for paused operators).
    OpDone = 3,
    /// Host → core: resume propagation for a paused operator.
    OpResume = 4,
    /// Decrement an operator's counter. Core → host asks for a relay to the
    /// owning core; host → core applies it.
    DecRef = 5,
    /// Core → host: an event sink operator finished.
    EventSinkDone = 6,
    /// Host → core: credit for an event source.
    EventSourceCredit = 7,
    /// Host → core: drop all state for a slot.
    Abort = 8,
}

impl MsgType {
    /// Every defined message type, in wire order.
    pub const ALL: [Self; 8] = [
        Self::FrameReady,
        Self::FrameDone,
        Self::OpDone,
        Self::OpResume,
        Self::DecRef,
        Self::EventSinkDone,
        Self::EventSourceCredit,
        Self::Abort,
    ];

    /// Decode a type byte.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownType`] for undefined values.
    pub const fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(Self::FrameReady),
            2 => Ok(Self::FrameDone),
            3 => Ok(Self::OpDone),
            4 => Ok(Self::OpResume),
            5 => Ok(Self::DecRef),
            6 => Ok(Self::EventSinkDone),
            7 => Ok(Self::EventSourceCredit),
            8 => Ok(Self::Abort),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

// ── Param packing ────────────────────────────────────────────────────────────

/// Slot-scoped param byte: slot index, one flag bit and a 4-bit sequence tag.
///
/// The flag means "capture statistics" on `FrameReady`/`FrameDone` and
/// "paused" on `OpDone`. The sequence tag lets the host discard messages
/// that belong to an earlier occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotParam {
    /// Pipeline slot (0 or 1).
    pub slot: u8,
    /// Message-specific flag.
    pub flag: bool,
    /// Low four bits of the frame sequence number.
    pub seq: u8,
}

impl SlotParam {
    const SLOT_MASK: u8 = 0x01;
    const FLAG_BIT: u8 = 1 << 1;
    const SEQ_SHIFT: u8 = 4;
    const SEQ_MASK: u8 = 0x0F;

    /// Build a param; `seq` is truncated to four bits.
    #[must_use]
    pub const fn new(slot: u8, flag: bool, seq: u8) -> Self {
        Self {
            slot: slot & Self::SLOT_MASK,
            flag,
            seq: seq & Self::SEQ_MASK,
        }
    }

    /// Pack into the wire byte.
    #[must_use]
    pub const fn pack(self) -> u8 {
        let flag = if self.flag { Self::FLAG_BIT } else { 0 };
        (self.slot & Self::SLOT_MASK) | flag | ((self.seq & Self::SEQ_MASK) << Self::SEQ_SHIFT)
    }

    /// Unpack a wire byte.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ReservedBits`] if bits 2..3 are set.
    pub const fn unpack(byte: u8) -> Result<Self, DecodeError> {
        if byte & 0x0C != 0 {
            return Err(DecodeError::ReservedBits(byte));
        }
        Ok(Self {
            slot: byte & Self::SLOT_MASK,
            flag: byte & Self::FLAG_BIT != 0,
            seq: byte >> Self::SEQ_SHIFT,
        })
    }

    /// Slot and sequence of a byte that failed [`unpack`](Self::unpack).
    ///
    /// Only the slot bit and the sequence nibble are kept, so a malformed
    /// message can still be charged to the frame it names.
    #[must_use]
    pub const fn salvage(byte: u8) -> Self {
        Self::new(byte & Self::SLOT_MASK, false, byte >> Self::SEQ_SHIFT)
    }

    /// Slot as an index into per-slot tables.
    #[must_use]
    pub const fn slot_index(self) -> usize {
        self.slot as usize
    }
}

// ── Payload ──────────────────────────────────────────────────────────────────

/// One 4-byte control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    /// Message type.
    pub ty: MsgType,
    /// Sub-code; for slot-scoped messages a packed [`SlotParam`].
    pub param: u8,
    /// Operator index, event index or similar.
    pub lparam: u16,
}

impl Payload {
    /// Size of a payload on the wire.
    pub const WIRE_BYTES: usize = 4;

    /// Build a raw payload.
    #[must_use]
    pub const fn new(ty: MsgType, param: u8, lparam: u16) -> Self {
        Self { ty, param, lparam }
    }

    /// Build a slot-scoped payload.
    #[must_use]
    pub const fn scoped(ty: MsgType, param: SlotParam, lparam: u16) -> Self {
        Self::new(ty, param.pack(), lparam)
    }

    /// `FrameReady` for a slot.
    #[must_use]
    pub const fn frame_ready(slot: u8, seq: u8, capture_stats: bool) -> Self {
        Self::scoped(MsgType::FrameReady, SlotParam::new(slot, capture_stats, seq), 0)
    }

    /// `FrameDone` for a slot. `lparam` carries the number of operators the
    /// reporting core completed.
    #[must_use]
    pub const fn frame_done(slot: u8, seq: u8, capture_stats: bool, completed: u16) -> Self {
        Self::scoped(MsgType::FrameDone, SlotParam::new(slot, capture_stats, seq), completed)
    }

    /// `OpDone` for an operator.
    #[must_use]
    pub const fn op_done(slot: u8, seq: u8, paused: bool, op: u16) -> Self {
        Self::scoped(MsgType::OpDone, SlotParam::new(slot, paused, seq), op)
    }

    /// `OpResume` for an operator.
    #[must_use]
    pub const fn op_resume(slot: u8, seq: u8, op: u16) -> Self {
        Self::scoped(MsgType::OpResume, SlotParam::new(slot, false, seq), op)
    }

    /// `DecRef` for an operator.
    #[must_use]
    pub const fn dec_ref(slot: u8, seq: u8, op: u16) -> Self {
        Self::scoped(MsgType::DecRef, SlotParam::new(slot, false, seq), op)
    }

    /// `EventSinkDone` for an event index.
    #[must_use]
    pub const fn event_sink_done(slot: u8, seq: u8, event: u16) -> Self {
        Self::scoped(MsgType::EventSinkDone, SlotParam::new(slot, false, seq), event)
    }

    /// `EventSourceCredit` for an event index.
    #[must_use]
    pub const fn event_source_credit(slot: u8, seq: u8, event: u16) -> Self {
        Self::scoped(MsgType::EventSourceCredit, SlotParam::new(slot, false, seq), event)
    }

    /// `Abort` for a slot.
    #[must_use]
    pub const fn abort(slot: u8, seq: u8) -> Self {
        Self::scoped(MsgType::Abort, SlotParam::new(slot, false, seq), 0)
    }

    /// Decode the param byte as a [`SlotParam`] and check the slot range.
    ///
    /// # Errors
    ///
    /// Returns an error for reserved bits or a slot outside the pipeline.
    pub const fn slot_param(&self) -> Result<SlotParam, DecodeError> {
        match SlotParam::unpack(self.param) {
            Ok(p) if (p.slot as usize) < TIKTOK_SLOTS => Ok(p),
            Ok(p) => Err(DecodeError::SlotOutOfRange(p.slot)),
            Err(e) => Err(e),
        }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        let lp = self.lparam.to_le_bytes();
        [self.ty as u8, self.param, lp[0], lp[1]]
    }

    /// Decode wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownType`] if byte 0 is not a defined type.
    pub const fn from_bytes(bytes: [u8; 4]) -> Result<Self, DecodeError> {
        match MsgType::from_u8(bytes[0]) {
            Ok(ty) => Ok(Self {
                ty,
                param: bytes[1],
                lparam: u16::from_le_bytes([bytes[2], bytes[3]]),
            }),
            Err(e) => Err(e),
        }
    }

    /// Encode as the 32-bit ring word (little-endian byte order).
    #[must_use]
    pub const fn to_word(self) -> u32 {
        u32::from_le_bytes(self.to_bytes())
    }

    /// Decode a 32-bit ring word.
    ///
    /// # Errors
    ///
    /// See [`Payload::from_bytes`].
    pub const fn from_word(word: u32) -> Result<Self, DecodeError> {
        Self::from_bytes(word.to_le_bytes())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Malformed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte 0 is not a defined [`MsgType`].
    UnknownType(u8),
    /// Reserved bits set in a slot-scoped param.
    ReservedBits(u8),
    /// Slot index outside the pipeline.
    SlotOutOfRange(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown message type {t:#04x}"),
            Self::ReservedBits(p) => write!(f, "reserved bits set in param {p:#04x}"),
            Self::SlotOutOfRange(s) => write!(f, "slot {s} out of range"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_fixed() {
        let p = Payload::op_done(1, 0xA, true, 0x1234);
        // type, param (slot=1 | paused | seq<<4), lparam LE
        assert_eq!(p.to_bytes(), [3, 0b1010_0011, 0x34, 0x12]);
        assert_eq!(p.to_word(), 0x1234_A303);
    }

    #[test]
    fn word_decodes_back() {
        let p = Payload::frame_done(0, 7, false, 42);
        assert_eq!(Payload::from_word(p.to_word()), Ok(p));
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            Payload::from_bytes([0, 0, 0, 0]),
            Err(DecodeError::UnknownType(0))
        );
        assert_eq!(
            Payload::from_bytes([0xF0, 0, 0, 0]),
            Err(DecodeError::UnknownType(0xF0))
        );
    }

    #[test]
    fn type_fits_in_a_nibble() {
        for ty in MsgType::ALL {
            assert!((ty as u8) < 16);
            assert_eq!(MsgType::from_u8(ty as u8), Ok(ty));
        }
    }

    #[test]
    fn seq_is_truncated_to_four_bits() {
        let p = SlotParam::new(0, false, 0x1F);
        assert_eq!(p.seq, 0xF);
        assert_eq!(SlotParam::unpack(p.pack()), Ok(p));
    }

    #[test]
    fn reserved_param_bits_rejected() {
        assert_eq!(SlotParam::unpack(0b0100), Err(DecodeError::ReservedBits(0b0100)));
        let p = Payload::new(MsgType::FrameDone, 0b1000, 0);
        assert!(p.slot_param().is_err());
    }

    #[test]
    fn salvage_keeps_slot_and_seq() {
        let p = SlotParam::salvage(0x5F);
        assert_eq!((p.slot, p.flag, p.seq), (1, false, 5));
    }
}
