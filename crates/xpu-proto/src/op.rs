//! Engine kinds and dependency edge kinds.

use std::fmt;

/// Engine an operator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OpType {
    /// Tensor transfer (DMA).
    Dma = 0,
    /// Convolution core.
    Conv = 1,
    /// Post-processing (pooling, activation, element-wise).
    Pdp = 2,
    /// Reshape / layout transform.
    Rubik = 3,
    /// Auxiliary DSP core.
    Dsp = 4,
}

/// Number of engine kinds. Also bounds the completion list of one producer.
pub const OP_TYPE_COUNT: usize = 5;

impl OpType {
    /// All engine kinds, in index order.
    pub const ALL: [Self; OP_TYPE_COUNT] =
        [Self::Dma, Self::Conv, Self::Pdp, Self::Rubik, Self::Dsp];

    /// Index into per-type tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`OpType::index`].
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < OP_TYPE_COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Whether completions of this engine are announced through the
    /// hardware broadcast header rather than a per-producer completion list.
    ///
    /// Only the convolution core has the header.
    #[must_use]
    pub const fn has_broadcast_header(self) -> bool {
        matches!(self, Self::Conv)
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "dma",
            Self::Conv => "conv",
            Self::Pdp => "pdp",
            Self::Rubik => "rubik",
            Self::Dsp => "dsp",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a consumer depends on a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Producer completion enables the consumer to be programmed.
    /// Does not count towards the consumer's dependency counter.
    EnabledBy,
    /// Producer completion decrements the consumer's counter at runtime.
    CompletedBy,
    /// Dependency satisfied by program order; resolved when the model loads.
    ProgrammedBy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trip() {
        for ty in OpType::ALL {
            assert_eq!(OpType::from_index(ty.index()), Some(ty));
        }
        assert_eq!(OpType::from_index(OP_TYPE_COUNT), None);
    }

    #[test]
    fn only_conv_broadcasts() {
        let broadcasting: Vec<_> = OpType::ALL
            .into_iter()
            .filter(|t| t.has_broadcast_header())
            .collect();
        assert_eq!(broadcasting, vec![OpType::Conv]);
    }
}
