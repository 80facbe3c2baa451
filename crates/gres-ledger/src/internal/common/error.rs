use thiserror::Error;

/// Error taxonomy of the allocation ledger.
///
/// Everything data-driven is returned as a value; panics are reserved for
/// violated caller contracts.
#[derive(Debug, Error)]
pub enum GresError {
    /// The raw count requested exceeds what remains available on a node.
    /// Fatal for the specific allocate call; the scheduler decides whether
    /// another node can serve the request.
    #[error("insufficient GRES: requested {requested}, only {available} available")]
    InsufficientResource { requested: u64, available: u64 },

    /// An allocation would push a node pool over its configured capacity.
    /// The mutation is refused.
    #[error(
        "GRES overallocation: {allocated} allocated + {requested} requested > {available} available"
    )]
    Overallocated {
        requested: u64,
        allocated: u64,
        available: u64,
    },

    /// A deallocation would drive a counter negative. The counter is clamped
    /// to zero; the error is surfaced unless the grant was marked as
    /// predating the current bookkeeping epoch.
    #[error("GRES deallocation underflow: releasing {releasing} with {recorded} recorded")]
    Underflow { releasing: u64, recorded: u64 },

    /// A structural request the ledger cannot represent.
    #[error("unsupported GRES operation: {0}")]
    Unsupported(String),

    /// Grant bitmap size disagrees with the node's current device count,
    /// typically after a live reconfiguration.
    #[error("GRES configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("error: {0}")]
    GenericError(String),
}

impl From<String> for GresError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for GresError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
