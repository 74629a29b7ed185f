use thiserror::Error;

use crate::chain::NodeId;
use crate::types::VirtAddr;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CursorError>;

/// Reasons a buffer chain could not be turned into a DMA segment list.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The node is stale or does not carry a packet header.
    #[error("node {0} is not a packet header")]
    NotAPacket(NodeId),
    /// Neither the caller nor the cursor configuration supplied a segment budget.
    #[error("no segment budget supplied and no default configured")]
    NoSegmentBudget,
    /// The packet holds no bytes.
    #[error("packet is empty")]
    EmptyPacket,
    /// Address translation failed and coalescing was not permitted.
    #[error("virtual address {0} has no physical mapping")]
    Unmapped(VirtAddr),
    /// The natural segment count overflows the budget and coalescing was not permitted.
    #[error("packet needs {needed} segments but the budget is {budget}")]
    BudgetExceeded {
        /// Segments the chain needs as laid out.
        needed: usize,
        /// Segment budget for the call.
        budget: usize,
    },
    /// The packet cannot be repacked to fit the segment budget.
    #[error("packet of {len} bytes cannot fit in {budget} segments")]
    PacketTooBig {
        /// Aggregate packet length.
        len: usize,
        /// Segment budget for the call.
        budget: usize,
    },
    /// The packet is longer than the single-segment copy ceiling.
    #[error("packet of {len} bytes exceeds the single-segment copy limit of {limit}")]
    TooLargeForSingleCopy {
        /// Aggregate packet length.
        len: usize,
        /// Effective copy ceiling.
        limit: usize,
    },
    /// The buffer pool could not supply a node.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(&'static str),
    /// Invalid configuration or mismatched collaborators.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CursorError {
    /// Whether the same packet could succeed if the caller allowed coalescing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CursorError::BudgetExceeded { .. } | CursorError::Unmapped(_)
        )
    }
}
