//! Compiled operator graph
//!
//! The input to model loading: operators in compiled order, each listing the
//! operators that depend on it. Engine parameters are a tagged enum so every
//! engine kind carries exactly its own fields.

use xpu_proto::{EdgeKind, OpType};

// ── Engine parameters ────────────────────────────────────────────────────────

/// Transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaConfig {
    /// Bytes read per transfer
    pub src_bytes: u32,
    /// Bytes written per transfer
    pub dst_bytes: u32,
}

/// Convolution parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    /// Kernel height and width
    pub kernel: (u8, u8),
    /// Stride in both dimensions
    pub stride: u8,
    /// Input channels
    pub in_channels: u16,
    /// Output channels
    pub out_channels: u16,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            kernel: (3, 3),
            stride: 1,
            in_channels: 1,
            out_channels: 1,
        }
    }
}

/// Post-processing function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdpFunction {
    /// Rectified linear
    #[default]
    Relu = 0,
    /// Max pooling
    MaxPool = 1,
    /// Average pooling
    AvgPool = 2,
    /// Element-wise add
    Add = 3,
}

/// Post-processing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdpConfig {
    /// Function applied
    pub function: PdpFunction,
    /// Pooling window (ignored for element-wise functions)
    pub window: u8,
}

/// Reshape parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RubikConfig {
    /// Axis permutation
    pub permutation: [u8; 4],
}

impl Default for RubikConfig {
    fn default() -> Self {
        Self {
            permutation: [0, 1, 2, 3],
        }
    }
}

/// DSP kernel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DspConfig {
    /// Firmware kernel to run
    pub kernel_id: u16,
    /// Scratch memory needed
    pub scratch_bytes: u32,
}

/// Per-engine configuration; the variant decides the operator's type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConfig {
    /// Tensor transfer
    Dma(DmaConfig),
    /// Convolution
    Conv(ConvConfig),
    /// Post-processing
    Pdp(PdpConfig),
    /// Reshape
    Rubik(RubikConfig),
    /// DSP kernel
    Dsp(DspConfig),
}

impl EngineConfig {
    /// Engine this configuration targets
    pub const fn op_type(&self) -> OpType {
        match self {
            Self::Dma(_) => OpType::Dma,
            Self::Conv(_) => OpType::Conv,
            Self::Pdp(_) => OpType::Pdp,
            Self::Rubik(_) => OpType::Rubik,
            Self::Dsp(_) => OpType::Dsp,
        }
    }

    /// Default parameters for an engine kind
    pub fn default_for(ty: OpType) -> Self {
        match ty {
            OpType::Dma => Self::Dma(DmaConfig::default()),
            OpType::Conv => Self::Conv(ConvConfig::default()),
            OpType::Pdp => Self::Pdp(PdpConfig::default()),
            OpType::Rubik => Self::Rubik(RubikConfig::default()),
            OpType::Dsp => Self::Dsp(DspConfig::default()),
        }
    }
}

// ── Operators ────────────────────────────────────────────────────────────────

/// Dependency of `consumer` on the operator that lists this edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Dependent operator
    pub consumer: u16,
    /// How it depends
    pub kind: EdgeKind,
}

/// External rendezvous role of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    /// Completion notifies the host with this event index
    Sink(u16),
    /// Waits for a host credit for this event index before running
    Source(u16),
}

/// One node of the compiled graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Unique index
    pub index: u16,
    /// Engine parameters
    pub config: EngineConfig,
    /// Operators depending on this one
    pub consumers: Vec<Edge>,
    /// Operator this one is fused onto
    pub fused_parent: Option<u16>,
    /// Event role, if any
    pub event: Option<EventRole>,
}

impl Operator {
    /// Operator with default parameters for `ty` and no edges
    pub fn new(index: u16, ty: OpType) -> Self {
        Self::with_config(index, EngineConfig::default_for(ty))
    }

    /// Operator with explicit parameters and no edges
    pub const fn with_config(index: u16, config: EngineConfig) -> Self {
        Self {
            index,
            config,
            consumers: Vec::new(),
            fused_parent: None,
            event: None,
        }
    }

    /// Engine this operator runs on
    pub const fn op_type(&self) -> OpType {
        self.config.op_type()
    }

    /// Add a dependent operator
    #[must_use]
    pub fn consumer(mut self, consumer: u16, kind: EdgeKind) -> Self {
        self.consumers.push(Edge { consumer, kind });
        self
    }

    /// Fuse onto `parent`
    #[must_use]
    pub const fn fused_to(mut self, parent: u16) -> Self {
        self.fused_parent = Some(parent);
        self
    }

    /// Give this operator an event role
    #[must_use]
    pub const fn event(mut self, role: EventRole) -> Self {
        self.event = Some(role);
        self
    }
}

/// Operators in compiled order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorGraph {
    ops: Vec<Operator>,
}

impl OperatorGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operator
    pub fn push(&mut self, op: Operator) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Operators in compiled order
    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    /// Number of operators
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the graph has no operators
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Linear `completed-by` chain over the given engine types
    pub fn chain(types: &[OpType]) -> Self {
        let mut graph = Self::new();
        for (i, ty) in types.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let index = i as u16;
            let mut op = Operator::new(index, *ty);
            if i + 1 < types.len() {
                op = op.consumer(index + 1, EdgeKind::CompletedBy);
            }
            graph.push(op);
        }
        graph
    }
}

impl FromIterator<Operator> for OperatorGraph {
    fn from_iter<I: IntoIterator<Item = Operator>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_decides_type() {
        for ty in OpType::ALL {
            assert_eq!(EngineConfig::default_for(ty).op_type(), ty);
            assert_eq!(Operator::new(0, ty).op_type(), ty);
        }
    }

    #[test]
    fn chain_links_neighbours() {
        let g = OperatorGraph::chain(&[OpType::Dma, OpType::Conv, OpType::Pdp]);
        assert_eq!(g.len(), 3);
        assert_eq!(
            g.ops()[0].consumers,
            vec![Edge { consumer: 1, kind: EdgeKind::CompletedBy }]
        );
        assert!(g.ops()[2].consumers.is_empty());
    }
}
