//! Protected outputs and the evidence produced when they are spent outside the authorized path.

use std::{collections::BTreeSet, fmt};

use bitcoin::{consensus, relative, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockRef;

/// What a protected output secures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// The output of a staking transaction.
    Staking,

    /// The output of an undelegation (unbonding) transaction.
    Undelegation,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staking => write!(f, "staking"),
            Self::Undelegation => write!(f, "undelegation"),
        }
    }
}

/// The spending paths a protected output may legitimately take.
///
/// A spend is authorized when the spending transaction is one of the pre-signed transactions, or
/// when the input consuming the output commits to a block-based relative timelock of at least
/// `min_relative_timelock` blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedSpend {
    /// Txids of the pre-signed transactions allowed to spend the output.
    #[serde(default)]
    pub presigned: BTreeSet<Txid>,

    /// Minimum relative timelock, in blocks, of a self-withdrawal.
    #[serde(default)]
    pub min_relative_timelock: Option<u16>,
}

impl AuthorizedSpend {
    /// Returns whether `spending_tx` consumes `outpoint` through an authorized path.
    pub fn authorizes(&self, spending_tx: &Transaction, outpoint: &OutPoint) -> bool {
        if self.presigned.contains(&spending_tx.compute_txid()) {
            return true;
        }

        let Some(min) = self.min_relative_timelock else {
            return false;
        };

        // relative timelocks are only enforced from version 2 onwards
        if spending_tx.version.0 < 2 {
            return false;
        }

        spending_tx
            .input
            .iter()
            .filter(|input| input.previous_output == *outpoint)
            .any(|input| {
                matches!(
                    input.sequence.to_relative_lock_time(),
                    Some(relative::LockTime::Blocks(height)) if height.value() >= min
                )
            })
    }
}

/// Errors building a [`ProtectedOutput`].
#[derive(Debug, Error)]
pub enum StakingError {
    /// The staking transaction does not deserialize.
    #[error("invalid staking transaction: {0}")]
    Decode(#[from] consensus::encode::Error),

    /// The staking transaction has no output at the given index.
    #[error("staking transaction has {outputs} outputs, no output {vout}")]
    MissingOutput {
        /// Requested output index.
        vout: u32,
        /// Number of outputs of the transaction.
        outputs: usize,
    },
}

/// A base-chain output under slashing surveillance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedOutput {
    /// The watched outpoint.
    pub outpoint: OutPoint,

    /// The consensus-encoded transaction creating the output.
    #[serde(with = "hex::serde")]
    pub staking_tx: Vec<u8>,

    /// What the output secures.
    pub kind: OutputKind,

    /// The legitimate ways to spend the output.
    pub authorized: AuthorizedSpend,
}

impl ProtectedOutput {
    /// Builds a protected output for output `vout` of the raw staking transaction.
    pub fn from_staking_tx(
        staking_tx: Vec<u8>,
        vout: u32,
        kind: OutputKind,
        authorized: AuthorizedSpend,
    ) -> Result<Self, StakingError> {
        let tx: Transaction = consensus::deserialize(&staking_tx)?;

        if vout as usize >= tx.output.len() {
            return Err(StakingError::MissingOutput {
                vout,
                outputs: tx.output.len(),
            });
        }

        Ok(Self {
            outpoint: OutPoint::new(tx.compute_txid(), vout),
            staking_tx,
            kind,
            authorized,
        })
    }

    /// Txid of the transaction creating the output.
    pub const fn staking_txid(&self) -> Txid {
        self.outpoint.txid
    }
}

/// Where the offending spend was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendLocation {
    /// Unconfirmed, in the node's mempool.
    Mempool,

    /// Confirmed in a block.
    Block(BlockRef),
}

impl fmt::Display for SpendLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mempool => write!(f, "mempool"),
            Self::Block(block) => write!(f, "block {block}"),
        }
    }
}

/// Proof that a protected output was spent outside its authorized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEvidence {
    /// The violated output.
    pub protected: OutPoint,

    /// What the violated output secured.
    pub kind: OutputKind,

    /// The consensus-encoded staking transaction the output derives from.
    #[serde(with = "hex::serde")]
    pub staking_tx: Vec<u8>,

    /// The offending transaction.
    pub spending_tx: Transaction,

    /// Where the offending transaction was seen.
    pub spent_at: SpendLocation,
}

impl SlashingEvidence {
    /// Builds evidence that `spending_tx` spent `protected` without authorization.
    pub fn new(
        protected: &ProtectedOutput,
        spending_tx: Transaction,
        spent_at: SpendLocation,
    ) -> Self {
        Self {
            protected: protected.outpoint,
            kind: protected.kind,
            staking_tx: protected.staking_tx.clone(),
            spending_tx,
            spent_at,
        }
    }

    /// Txid of the offending transaction.
    pub fn spending_txid(&self) -> Txid {
        self.spending_tx.compute_txid()
    }
}

#[cfg(test)]
mod tests {
    use anchor_watch_test_utils::bitcoin::{generate_outpoint, generate_spending_tx, generate_tx};
    use bitcoin::Sequence;

    use super::*;

    fn protected(authorized: AuthorizedSpend) -> ProtectedOutput {
        let staking_tx = consensus::serialize(&generate_tx(1, 2));
        ProtectedOutput::from_staking_tx(staking_tx, 1, OutputKind::Staking, authorized).unwrap()
    }

    #[test]
    fn presigned_spend_is_authorized() {
        let output = protected(AuthorizedSpend::default());
        let unbonding = generate_spending_tx(output.outpoint, Sequence::MAX);

        let mut authorized = AuthorizedSpend::default();
        assert!(!authorized.authorizes(&unbonding, &output.outpoint));

        authorized.presigned.insert(unbonding.compute_txid());
        assert!(authorized.authorizes(&unbonding, &output.outpoint));
    }

    #[test]
    fn timelocked_spend_is_authorized_only_past_minimum() {
        let output = protected(AuthorizedSpend::default());
        let authorized = AuthorizedSpend {
            presigned: BTreeSet::new(),
            min_relative_timelock: Some(144),
        };

        let early = generate_spending_tx(output.outpoint, Sequence::from_height(143));
        let on_time = generate_spending_tx(output.outpoint, Sequence::from_height(144));
        let time_based =
            generate_spending_tx(output.outpoint, Sequence::from_512_second_intervals(200));
        let disabled = generate_spending_tx(output.outpoint, Sequence::MAX);

        assert!(!authorized.authorizes(&early, &output.outpoint));
        assert!(authorized.authorizes(&on_time, &output.outpoint));
        assert!(!authorized.authorizes(&time_based, &output.outpoint));
        assert!(!authorized.authorizes(&disabled, &output.outpoint));
    }

    #[test]
    fn timelock_must_sit_on_the_protected_input() {
        let output = protected(AuthorizedSpend::default());
        let authorized = AuthorizedSpend {
            presigned: BTreeSet::new(),
            min_relative_timelock: Some(10),
        };

        let unrelated = generate_spending_tx(generate_outpoint(), Sequence::from_height(100));

        assert!(!authorized.authorizes(&unrelated, &output.outpoint));
    }

    #[test]
    fn missing_output_is_rejected() {
        let staking_tx = consensus::serialize(&generate_tx(1, 2));
        let err = ProtectedOutput::from_staking_tx(
            staking_tx,
            2,
            OutputKind::Undelegation,
            AuthorizedSpend::default(),
        )
        .unwrap_err();

        assert!(matches!(err, StakingError::MissingOutput { vout: 2, outputs: 2 }));
        assert!(ProtectedOutput::from_staking_tx(
            vec![0xde, 0xad],
            0,
            OutputKind::Staking,
            AuthorizedSpend::default()
        )
        .is_err());
    }

    #[test]
    fn evidence_serde_json() {
        let output = protected(AuthorizedSpend::default());
        let spend = generate_spending_tx(output.outpoint, Sequence::MAX);
        let evidence = SlashingEvidence::new(&output, spend, SpendLocation::Mempool);

        let serialized = serde_json::to_string(&evidence).unwrap();
        let deserialized = serde_json::from_str::<SlashingEvidence>(&serialized).unwrap();

        assert_eq!(deserialized, evidence);
        assert_eq!(deserialized.staking_tx, output.staking_tx);
    }
}
