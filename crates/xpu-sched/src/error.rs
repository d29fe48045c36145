//! Error types for scheduler operations

use thiserror::Error;
use xpu_proto::DecodeError;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;

/// Errors that can occur while loading models and scheduling frames
#[derive(Debug, Error)]
pub enum SchedError {
    /// The compiled graph is malformed
    #[error("Invalid graph: {reason}")]
    InvalidGraph {
        /// Reason for rejection
        reason: String,
    },

    /// A fixed-capacity table overflowed
    #[error("{what} exceeds capacity {capacity}")]
    ResourceExhausted {
        /// Which table overflowed
        what: String,
        /// Fixed capacity of that table
        capacity: usize,
    },

    /// The owning user context has been torn down
    #[error("Context {context} has been torn down")]
    ContextTornDown {
        /// Context identifier
        context: u32,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Malformed or impossible message from a peer
    #[error("Protocol violation: {reason}")]
    Protocol {
        /// What was wrong with the message
        reason: String,
    },

    /// Message could not be decoded
    #[error("Undecodable message: {source}")]
    Decode {
        /// Underlying decode error
        #[from]
        source: DecodeError,
    },

    /// Non-blocking send found the ring full
    #[error("Channel full ({fifo_size} slots)")]
    ChannelFull {
        /// Ring capacity
        fifo_size: usize,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Shared memory could not be mapped
    #[error("Shared memory error: {reason}")]
    SharedMemory {
        /// Reason for failure
        reason: String,
    },

    /// A buffer-binding or program-encoding collaborator failed
    #[error("Buffer binding failed: {reason}")]
    Binding {
        /// Reason for failure
        reason: String,
    },

    /// A scheduler thread could not be spawned
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl SchedError {
    /// Create an invalid graph error
    pub fn invalid_graph(reason: impl Into<String>) -> Self {
        Self::InvalidGraph {
            reason: reason.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn exhausted(what: impl Into<String>, capacity: usize) -> Self {
        Self::ResourceExhausted {
            what: what.into(),
            capacity,
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a shared memory error
    pub fn shared_memory(reason: impl Into<String>) -> Self {
        Self::SharedMemory {
            reason: reason.into(),
        }
    }

    /// Create a binding error
    pub fn binding(reason: impl Into<String>) -> Self {
        Self::Binding {
            reason: reason.into(),
        }
    }
}
