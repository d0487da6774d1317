//! Errors raised by the slasher.

use anchor_watch_primitives::staking::StakingError;
use bitcoin::{consensus, OutPoint};
use btc_follower::rpc::ClientError;
use thiserror::Error;

/// Errors raised by the slasher.
#[derive(Debug, Error)]
pub enum SlasherError {
    /// The transaction bytes do not deserialize.
    #[error("invalid transaction: {0}")]
    Decode(#[from] consensus::encode::Error),

    /// The node could not answer.
    #[error("bitcoin rpc failed: {0}")]
    Rpc(#[from] ClientError),

    /// The protected output could not be built.
    #[error(transparent)]
    Staking(#[from] StakingError),

    /// The output is already under surveillance.
    #[error("{0} is already protected")]
    AlreadyRegistered(OutPoint),

    /// The output was already slashed or withdrawn.
    #[error("{0} is no longer watched")]
    Finished(OutPoint),
}
