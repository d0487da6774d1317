//! An in-memory side-chain node for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anchor_watch_primitives::{
    checkpoint::{Checkpoint, CheckpointId},
    staking::SlashingEvidence,
};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    client::{SideChain, SideChainError, SideChainResult},
    types::{RpcAnchorTx, RpcCheckpointStatus, RpcSubmitOutcome},
};

#[derive(Debug, Default)]
struct MockState {
    submissions: Vec<Checkpoint>,
    statuses: HashMap<CheckpointId, RpcCheckpointStatus>,
    submit_failures: VecDeque<SideChainError>,
    status_failures: VecDeque<SideChainError>,
    anchors: Vec<RpcAnchorTx>,
    anchors_offline: bool,
    evidence: Vec<SlashingEvidence>,
    evidence_failures: VecDeque<SideChainError>,
}

/// Scripted stand-in for the side-chain node.
///
/// Checkpoints are accepted unless a failure was queued with [`Self::fail_next_submits`]; an
/// accepted checkpoint reports [`RpcCheckpointStatus::Accepted`] afterwards.
#[derive(Debug, Clone, Default)]
pub struct MockSideChain {
    state: Arc<Mutex<MockState>>,
}

impl MockSideChain {
    /// Creates an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next submissions fail with `errors`, in order.
    pub fn fail_next_submits(&self, errors: impl IntoIterator<Item = SideChainError>) {
        self.state.lock().submit_failures.extend(errors);
    }

    /// Makes the next status queries fail with `errors`, in order.
    pub fn fail_next_status(&self, errors: impl IntoIterator<Item = SideChainError>) {
        self.state.lock().status_failures.extend(errors);
    }

    /// Makes the next evidence deliveries fail with `errors`, in order.
    pub fn fail_next_evidence(&self, errors: impl IntoIterator<Item = SideChainError>) {
        self.state.lock().evidence_failures.extend(errors);
    }

    /// Overrides the status reported for `id`.
    pub fn set_status(&self, id: CheckpointId, status: RpcCheckpointStatus) {
        self.state.lock().statuses.insert(id, status);
    }

    /// Replaces the list of transactions waiting to be anchored.
    pub fn set_anchors(&self, anchors: Vec<RpcAnchorTx>) {
        self.state.lock().anchors = anchors;
    }

    /// Makes `pending_anchors` fail while `offline` is set.
    pub fn set_anchors_offline(&self, offline: bool) {
        self.state.lock().anchors_offline = offline;
    }

    /// Every submission attempt that reached the node, failed ones excluded.
    pub fn submissions(&self) -> Vec<Checkpoint> {
        self.state.lock().submissions.clone()
    }

    /// Every piece of evidence delivered so far.
    pub fn evidence(&self) -> Vec<SlashingEvidence> {
        self.state.lock().evidence.clone()
    }
}

#[async_trait]
impl SideChain for MockSideChain {
    async fn submit_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> SideChainResult<RpcSubmitOutcome> {
        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }

        state.submissions.push(checkpoint.clone());
        let previous = state
            .statuses
            .insert(checkpoint.id, RpcCheckpointStatus::Accepted);

        Ok(match previous {
            Some(RpcCheckpointStatus::Accepted) => RpcSubmitOutcome::AlreadyKnown,
            _ => RpcSubmitOutcome::Accepted,
        })
    }

    async fn checkpoint_status(&self, id: CheckpointId) -> SideChainResult<RpcCheckpointStatus> {
        let mut state = self.state.lock();
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }

        Ok(state
            .statuses
            .get(&id)
            .cloned()
            .unwrap_or(RpcCheckpointStatus::Unknown))
    }

    async fn pending_anchors(&self) -> SideChainResult<Vec<RpcAnchorTx>> {
        let state = self.state.lock();
        if state.anchors_offline {
            return Err(SideChainError::Transient("connection refused".to_string()));
        }

        Ok(state.anchors.clone())
    }

    async fn submit_evidence(&self, evidence: &SlashingEvidence) -> SideChainResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.evidence_failures.pop_front() {
            return Err(err);
        }

        state.evidence.push(evidence.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anchor_watch_primitives::staking::{
        AuthorizedSpend, OutputKind, ProtectedOutput, SpendLocation,
    };
    use anchor_watch_test_utils::bitcoin::{generate_spending_tx, generate_tx};
    use bitcoin::{consensus, OutPoint, Sequence};

    use super::*;

    #[tokio::test]
    async fn resubmission_is_already_known() {
        let node = MockSideChain::new();
        let checkpoint = Checkpoint {
            id: CheckpointId(4),
            payload: vec![1, 2, 3],
            sources: vec![],
        };

        node.fail_next_submits([SideChainError::Transient("busy".into())]);
        assert!(node.submit_checkpoint(&checkpoint).await.is_err());
        assert_eq!(
            node.checkpoint_status(CheckpointId(4)).await.unwrap(),
            RpcCheckpointStatus::Unknown
        );

        assert_eq!(
            node.submit_checkpoint(&checkpoint).await.unwrap(),
            RpcSubmitOutcome::Accepted
        );
        assert_eq!(
            node.submit_checkpoint(&checkpoint).await.unwrap(),
            RpcSubmitOutcome::AlreadyKnown
        );
        assert_eq!(node.submissions().len(), 2);
    }

    #[tokio::test]
    async fn evidence_is_recorded_once_delivered() {
        let node = MockSideChain::new();

        let staking_tx = generate_tx(1, 2);
        let protected = ProtectedOutput::from_staking_tx(
            consensus::serialize(&staking_tx),
            0,
            OutputKind::Staking,
            AuthorizedSpend::default(),
        )
        .unwrap();
        let spend = generate_spending_tx(OutPoint::new(staking_tx.compute_txid(), 0), Sequence::MAX);
        let evidence = SlashingEvidence::new(&protected, spend, SpendLocation::Mempool);

        node.fail_next_evidence([SideChainError::Transient("busy".into())]);
        assert!(node.submit_evidence(&evidence).await.is_err());
        assert!(node.evidence().is_empty());

        node.submit_evidence(&evidence).await.unwrap();
        assert_eq!(node.evidence(), vec![evidence]);
    }
}
