//! Program encoding and buffer binding
//!
//! Two collaborators sit at the edge of the scheduler: something that turns
//! an operator into the bytes its engine executes, and something that makes
//! host buffers addressable by the accelerator. Both are traits; the
//! software implementations here are what the cluster uses when no hardware
//! is attached.
//!
//! ## Envelope record
//!
//! ```text
//! off  size  field
//! 0x0  2     magic "XP"
//! 0x2  2     operator index
//! 0x4  1     engine type
//! 0x5  1     counter at frame start
//! 0x6  1     completion list length (n)
//! 0x7  1     broadcast list length (m)
//! 0x8  2     enable consumer (0xFFFF = none)
//! 0xA  2     fused parent    (0xFFFF = none)
//! 0xC  2     engine config length (k)
//! 0xE  k     engine config
//! ...  2n    completion list
//! ...  2m    broadcast list
//! ```
//!
//! All multi-byte fields are little-endian.

use crate::error::{Result, SchedError};
use crate::graph::{EngineConfig, Operator, OperatorGraph};
use crate::resolver::{OpMeta, ResolvedModel};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use xpu_proto::op::OP_TYPE_COUNT;
use xpu_proto::OpType;

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Turns one operator into engine program bytes
pub trait ProgramEncoder: Send + Sync {
    /// Append the program for `op` to `out`
    ///
    /// # Errors
    ///
    /// Returns an error if the operator cannot be expressed for its engine.
    fn encode(&self, op: &Operator, meta: &OpMeta, out: &mut BytesMut) -> Result<()>;
}

/// Self-describing envelope format understood by the software cores
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeEncoder;

/// Decoded fixed part of an envelope record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Operator index
    pub index: u16,
    /// Engine
    pub ty: OpType,
    /// Counter at frame start
    pub counter: u8,
    /// Completion list length
    pub completion_len: u8,
    /// Broadcast list length
    pub broadcast_len: u8,
    /// Enable consumer
    pub enable_consumer: Option<u16>,
    /// Fused parent
    pub fused_parent: Option<u16>,
}

impl EnvelopeEncoder {
    /// Record magic
    pub const MAGIC: u16 = 0x5058;
    const NONE: u16 = 0xFFFF;
    const HEADER_BYTES: usize = 14;

    fn put_config(config: &EngineConfig, out: &mut BytesMut) {
        match config {
            EngineConfig::Dma(c) => {
                out.put_u32_le(c.src_bytes);
                out.put_u32_le(c.dst_bytes);
            }
            EngineConfig::Conv(c) => {
                out.put_u8(c.kernel.0);
                out.put_u8(c.kernel.1);
                out.put_u8(c.stride);
                out.put_u16_le(c.in_channels);
                out.put_u16_le(c.out_channels);
            }
            EngineConfig::Pdp(c) => {
                out.put_u8(c.function as u8);
                out.put_u8(c.window);
            }
            EngineConfig::Rubik(c) => out.put_slice(&c.permutation),
            EngineConfig::Dsp(c) => {
                out.put_u16_le(c.kernel_id);
                out.put_u32_le(c.scratch_bytes);
            }
        }
    }

    /// Parse every record header in a segment
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Binding`] for a truncated record or bad magic.
    pub fn headers(mut segment: &[u8]) -> Result<Vec<EnvelopeHeader>> {
        let mut headers = Vec::new();
        while segment.has_remaining() {
            if segment.remaining() < Self::HEADER_BYTES {
                return Err(SchedError::binding("truncated program record"));
            }
            let magic = segment.get_u16_le();
            if magic != Self::MAGIC {
                return Err(SchedError::binding(format!("bad program magic {magic:#06x}")));
            }
            let index = segment.get_u16_le();
            let ty = OpType::from_index(usize::from(segment.get_u8()))
                .ok_or_else(|| SchedError::binding("bad engine type in program record"))?;
            let counter = segment.get_u8();
            let completion_len = segment.get_u8();
            let broadcast_len = segment.get_u8();
            let enable = segment.get_u16_le();
            let fused = segment.get_u16_le();
            let config_len = usize::from(segment.get_u16_le());
            let tail = config_len + 2 * (usize::from(completion_len) + usize::from(broadcast_len));
            if segment.remaining() < tail {
                return Err(SchedError::binding("truncated program record"));
            }
            segment.advance(tail);
            headers.push(EnvelopeHeader {
                index,
                ty,
                counter,
                completion_len,
                broadcast_len,
                enable_consumer: (enable != Self::NONE).then_some(enable),
                fused_parent: (fused != Self::NONE).then_some(fused),
            });
        }
        Ok(headers)
    }
}

impl ProgramEncoder for EnvelopeEncoder {
    fn encode(&self, op: &Operator, meta: &OpMeta, out: &mut BytesMut) -> Result<()> {
        if op.op_type() != meta.ty || op.index != meta.index {
            return Err(SchedError::binding(format!(
                "operator {} does not match its resolved record",
                op.index
            )));
        }
        let mut config = BytesMut::new();
        Self::put_config(&op.config, &mut config);
        let (Ok(completion_len), Ok(broadcast_len), Ok(config_len)) = (
            u8::try_from(meta.completion.len()),
            u8::try_from(meta.broadcast.len()),
            u16::try_from(config.len()),
        ) else {
            return Err(SchedError::binding(format!(
                "operator {} lists too large for an envelope",
                op.index
            )));
        };

        let lists = meta.completion.len() + meta.broadcast.len();
        out.reserve(Self::HEADER_BYTES + config.len() + 2 * lists);
        out.put_u16_le(Self::MAGIC);
        out.put_u16_le(meta.index);
        #[allow(clippy::cast_possible_truncation)]
        out.put_u8(meta.ty.index() as u8);
        out.put_u8(meta.counter);
        out.put_u8(completion_len);
        out.put_u8(broadcast_len);
        out.put_u16_le(meta.enable_consumer.unwrap_or(Self::NONE));
        out.put_u16_le(meta.fused_parent.unwrap_or(Self::NONE));
        out.put_u16_le(config_len);
        out.put_slice(&config);
        for c in meta.completion.iter().chain(&meta.broadcast) {
            out.put_u16_le(*c);
        }
        Ok(())
    }
}

// ── Binding ──────────────────────────────────────────────────────────────────

/// Host buffer to be made visible to the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle {
    /// Caller-chosen identifier
    pub id: u64,
    /// Length in bytes
    pub len: usize,
}

impl TensorHandle {
    /// New handle
    pub const fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }
}

/// Maps buffers into the accelerator's address space
pub trait BufferBinder: Send + Sync {
    /// Map `handle` and return its device address
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Binding`] if the buffer cannot be mapped.
    fn bind(&self, handle: &TensorHandle) -> Result<u64>;

    /// Unmap a device address returned by [`bind`](Self::bind)
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Binding`] for an address that is not bound.
    fn release(&self, iova: u64) -> Result<()>;

    /// Number of live mappings
    fn live(&self) -> usize;
}

#[derive(Debug)]
struct BinderState {
    next: u64,
    live: HashMap<u64, TensorHandle>,
    /// Released ranges below `next`, start → length, never adjacent
    free: BTreeMap<u64, u64>,
}

impl BinderState {
    /// First released range that fits `span`
    fn take_free(&mut self, span: u64) -> Option<u64> {
        let (&start, &len) = self.free.iter().find(|(_, len)| **len >= span)?;
        self.free.remove(&start);
        if len > span {
            self.free.insert(start + span, len - span);
        }
        Some(start)
    }

    fn give_back(&mut self, mut start: u64, mut len: u64) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        if start + len == self.next {
            self.next = start;
        } else {
            self.free.insert(start, len);
        }
    }
}

/// First-fit page allocator over a fixed IOVA aperture
#[derive(Debug)]
pub struct SoftwareBinder {
    state: Mutex<BinderState>,
    limit: u64,
}

impl SoftwareBinder {
    /// Start of the aperture
    pub const IOVA_BASE: u64 = 0x1000_0000;
    /// Aperture size
    pub const APERTURE: u64 = 1 << 30;
    const PAGE: u64 = 4096;

    fn span(len: usize) -> u64 {
        (len as u64).div_ceil(Self::PAGE) * Self::PAGE
    }

    /// Empty binder
    pub fn new() -> Self {
        Self::with_aperture(Self::APERTURE)
    }

    /// Binder with a custom aperture size
    pub fn with_aperture(bytes: u64) -> Self {
        Self {
            state: Mutex::new(BinderState {
                next: Self::IOVA_BASE,
                live: HashMap::new(),
                free: BTreeMap::new(),
            }),
            limit: Self::IOVA_BASE + bytes,
        }
    }
}

impl Default for SoftwareBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferBinder for SoftwareBinder {
    fn bind(&self, handle: &TensorHandle) -> Result<u64> {
        if handle.len == 0 {
            return Err(SchedError::binding(format!("tensor {} has zero length", handle.id)));
        }
        let span = Self::span(handle.len);
        let mut state = self.state.lock();
        let iova = match state.take_free(span) {
            Some(iova) => iova,
            None => {
                let iova = state.next;
                if iova + span > self.limit {
                    return Err(SchedError::binding(format!(
                        "IOVA aperture exhausted binding tensor {} ({} bytes)",
                        handle.id, handle.len
                    )));
                }
                state.next += span;
                iova
            }
        };
        state.live.insert(iova, *handle);
        debug!("Bound tensor {} ({} bytes) at {:#x}", handle.id, handle.len, iova);
        Ok(iova)
    }

    fn release(&self, iova: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(handle) = state.live.remove(&iova) else {
            warn!("Release of unbound IOVA {:#x}", iova);
            return Err(SchedError::binding(format!("IOVA {iova:#x} is not bound")));
        };
        state.give_back(iova, Self::span(handle.len));
        Ok(())
    }

    fn live(&self) -> usize {
        self.state.lock().live.len()
    }
}

// ── Program image ────────────────────────────────────────────────────────────

/// Encoded per-engine program segments and their device addresses
#[derive(Debug, Clone)]
pub struct ProgramImage {
    segments: [Bytes; OP_TYPE_COUNT],
    iova: [u64; OP_TYPE_COUNT],
}

impl ProgramImage {
    /// Encode every operator and bind the non-empty segments
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or binding fails. Segments bound before
    /// the failure are released.
    pub fn build(
        graph: &OperatorGraph,
        model: &ResolvedModel,
        encoder: &dyn ProgramEncoder,
        binder: &dyn BufferBinder,
    ) -> Result<Self> {
        let mut buffers: [BytesMut; OP_TYPE_COUNT] = Default::default();
        for op in graph.ops() {
            let meta = model
                .op(op.index)
                .ok_or_else(|| SchedError::binding(format!("operator {} not resolved", op.index)))?;
            encoder.encode(op, meta, &mut buffers[meta.ty.index()])?;
        }

        let segments = buffers.map(BytesMut::freeze);
        let mut iova = [0u64; OP_TYPE_COUNT];
        for ty in OpType::ALL {
            let segment = &segments[ty.index()];
            if segment.is_empty() {
                continue;
            }
            match binder.bind(&TensorHandle::new(ty.index() as u64, segment.len())) {
                Ok(addr) => iova[ty.index()] = addr,
                Err(e) => {
                    for addr in iova.iter().filter(|a| **a != 0) {
                        let _ = binder.release(*addr);
                    }
                    return Err(e);
                }
            }
        }
        debug!(
            "Program image: segment bytes {:?}",
            segments.iter().map(Bytes::len).collect::<Vec<_>>()
        );
        Ok(Self { segments, iova })
    }

    /// Program bytes for one engine
    pub fn segment(&self, ty: OpType) -> &Bytes {
        &self.segments[ty.index()]
    }

    /// Device address of one engine's segment (0 when empty)
    pub const fn iova(&self, ty: OpType) -> u64 {
        self.iova[ty.index()]
    }

    /// Address table as published in the frame descriptor
    pub fn address_table(&self) -> Bytes {
        Bytes::copy_from_slice(bytemuck::cast_slice::<u64, u8>(&self.iova))
    }

    /// Release every bound segment
    pub fn release(&self, binder: &dyn BufferBinder) {
        for addr in self.iova.iter().filter(|a| **a != 0) {
            if let Err(e) = binder.release(*addr) {
                warn!("Program segment release failed: {e}");
            }
        }
    }
}
