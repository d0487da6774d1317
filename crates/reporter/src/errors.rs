//! Errors raised by the reporter.

use anchor_watch_primitives::checkpoint::CheckpointId;
use anchor_watch_sidechain::SideChainError;
use thiserror::Error;

/// Errors raised while reporting checkpoints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReporterError {
    /// The side-chain call failed.
    #[error("side-chain call failed: {0}")]
    SideChain(#[from] SideChainError),

    /// The side-chain reports the checkpoint as rejected.
    #[error("checkpoint rejected by the side-chain: {0}")]
    Rejected(String),

    /// A reorg invalidated the checkpoint while it was being submitted.
    #[error("checkpoint {0} was invalidated by a reorg")]
    Superseded(CheckpointId),

    /// A rescan was requested with `from > to`.
    #[error("invalid rescan range {from}..={to}")]
    InvalidRange {
        /// First height of the range.
        from: u64,

        /// Last height of the range.
        to: u64,
    },

    /// A rescan was requested over more blocks than allowed.
    #[error("rescan of {requested} blocks exceeds the limit of {limit}")]
    RangeTooLarge {
        /// Number of blocks requested.
        requested: u64,

        /// Configured limit.
        limit: u64,
    },

    /// The ingest worker is not running.
    #[error("reporter is not running")]
    NotRunning,
}

impl ReporterError {
    /// Whether retrying the submission later may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::SideChain(err) => err.is_transient(),
            _ => false,
        }
    }
}
