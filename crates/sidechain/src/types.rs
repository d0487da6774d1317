//! Types exchanged with the side-chain node.

use anchor_watch_primitives::{
    block::BlockRef,
    checkpoint::{Checkpoint, CheckpointId},
    staking::{OutputKind, SlashingEvidence, SpendLocation},
};
use bitcoin::{consensus, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// A checkpoint read off the base chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCheckpoint {
    /// Identifier of the checkpoint.
    pub id: CheckpointId,

    /// The assembled checkpoint payload.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,

    /// Blocks the fragments were found in.
    pub sources: Vec<BlockRef>,
}

impl From<&Checkpoint> for RpcCheckpoint {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.id,
            payload: checkpoint.payload.clone(),
            sources: checkpoint.sources.clone(),
        }
    }
}

/// Outcome of a successful checkpoint submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcSubmitOutcome {
    /// The side-chain accepted the checkpoint.
    Accepted,

    /// The side-chain had already accepted the checkpoint.
    AlreadyKnown,
}

/// What the side-chain knows about a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RpcCheckpointStatus {
    /// Never seen.
    Unknown,

    /// Received, not yet processed.
    Pending,

    /// Accepted.
    Accepted,

    /// Rejected as invalid.
    Rejected {
        /// Why the checkpoint was rejected.
        reason: String,
    },
}

/// A signed side-chain transaction waiting to be anchored on the base chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcAnchorTx {
    /// Side-chain identifier of the anchoring request.
    pub id: u64,

    /// The consensus-encoded signed base-chain transaction.
    #[serde(with = "hex::serde")]
    pub tx: Vec<u8>,
}

impl RpcAnchorTx {
    /// Decodes the transaction.
    pub fn decode(&self) -> Result<Transaction, consensus::encode::Error> {
        consensus::deserialize(&self.tx)
    }
}

/// Proof that a staker spent a protected output outside its authorized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSlashingEvidence {
    /// The violated output.
    pub protected: OutPoint,

    /// What the output secured.
    pub kind: OutputKind,

    /// The consensus-encoded staking transaction.
    #[serde(with = "hex::serde")]
    pub staking_tx: Vec<u8>,

    /// Txid of the offending transaction.
    pub spending_txid: Txid,

    /// The consensus-encoded offending transaction.
    #[serde(with = "hex::serde")]
    pub spending_tx: Vec<u8>,

    /// Where the offending transaction was seen.
    pub spent_at: SpendLocation,
}

impl From<&SlashingEvidence> for RpcSlashingEvidence {
    fn from(evidence: &SlashingEvidence) -> Self {
        Self {
            protected: evidence.protected,
            kind: evidence.kind,
            staking_tx: evidence.staking_tx.clone(),
            spending_txid: evidence.spending_txid(),
            spending_tx: consensus::serialize(&evidence.spending_tx),
            spent_at: evidence.spent_at,
        }
    }
}
