//! Lifecycle of protected outputs and of the evidence they produce.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anchor_watch_primitives::{
    block::BlockRef,
    staking::{ProtectedOutput, SlashingEvidence},
};
use bitcoin::{OutPoint, Transaction};

use crate::errors::SlasherError;

/// Counts describing the slasher's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Outputs under surveillance.
    pub tracked: usize,

    /// Outputs spent outside their authorized path.
    pub terminal: usize,

    /// Outputs withdrawn through an authorized path.
    pub withdrawn: usize,

    /// Evidence not yet accepted by the sink.
    pub pending_evidence: usize,
}

/// Protected outputs, finished outputs and undelivered evidence.
///
/// An output leaves `tracked` exactly once, either to `terminal` together with its evidence or to
/// `withdrawn`.
#[derive(Debug, Default)]
pub struct SlasherState {
    tracked: BTreeMap<OutPoint, ProtectedOutput>,
    terminal: BTreeSet<OutPoint>,
    withdrawn: BTreeSet<OutPoint>,
    pending_evidence: VecDeque<SlashingEvidence>,

    /// Mined spends of tracked outputs still short of the required confirmations.
    ///
    /// Confirmations keep being counted from here once the spend is deeper than the spender
    /// search reaches.
    mined_spends: BTreeMap<OutPoint, (Transaction, BlockRef)>,
}

impl SlasherState {
    /// Puts `output` under surveillance.
    pub fn register(&mut self, output: ProtectedOutput) -> Result<(), SlasherError> {
        let outpoint = output.outpoint;

        if self.terminal.contains(&outpoint) || self.withdrawn.contains(&outpoint) {
            return Err(SlasherError::Finished(outpoint));
        }
        if self.tracked.contains_key(&outpoint) {
            return Err(SlasherError::AlreadyRegistered(outpoint));
        }

        self.tracked.insert(outpoint, output);
        Ok(())
    }

    /// A copy of every tracked output, to be checked without holding the lock.
    pub fn snapshot(&self) -> Vec<ProtectedOutput> {
        self.tracked.values().cloned().collect()
    }

    /// Marks the output slashed and queues `evidence` for delivery.
    ///
    /// Returns `false` if the output was not tracked anymore.
    pub fn slash(&mut self, evidence: SlashingEvidence) -> bool {
        if self.tracked.remove(&evidence.protected).is_none() {
            return false;
        }
        self.mined_spends.remove(&evidence.protected);

        self.terminal.insert(evidence.protected);
        self.pending_evidence.push_back(evidence);
        true
    }

    /// Marks the output withdrawn through an authorized path.
    pub fn withdraw(&mut self, outpoint: &OutPoint) -> bool {
        if self.tracked.remove(outpoint).is_none() {
            return false;
        }
        self.mined_spends.remove(outpoint);

        self.withdrawn.insert(*outpoint);
        true
    }

    /// Remembers that `spender` of a tracked output was mined in `block`.
    pub fn remember_spend(&mut self, outpoint: OutPoint, spender: Transaction, block: BlockRef) {
        if self.tracked.contains_key(&outpoint) {
            self.mined_spends.insert(outpoint, (spender, block));
        }
    }

    /// The mined spend remembered for `outpoint`.
    pub fn mined_spend(&self, outpoint: &OutPoint) -> Option<(Transaction, BlockRef)> {
        self.mined_spends.get(outpoint).cloned()
    }

    /// Drops the mined spend of `outpoint`, after it was reorganized away.
    pub fn forget_spend(&mut self, outpoint: &OutPoint) {
        self.mined_spends.remove(outpoint);
    }

    /// The oldest undelivered evidence.
    pub fn next_evidence(&self) -> Option<SlashingEvidence> {
        self.pending_evidence.front().cloned()
    }

    /// Drops the oldest undelivered evidence once the sink accepted it.
    pub fn evidence_delivered(&mut self) {
        self.pending_evidence.pop_front();
    }

    /// Whether `outpoint` is under surveillance.
    pub fn is_tracked(&self, outpoint: &OutPoint) -> bool {
        self.tracked.contains_key(outpoint)
    }

    /// Tallies the outputs by state.
    pub fn counts(&self) -> Counts {
        Counts {
            tracked: self.tracked.len(),
            terminal: self.terminal.len(),
            withdrawn: self.withdrawn.len(),
            pending_evidence: self.pending_evidence.len(),
        }
    }
}
