//! Hands slashing evidence to the side-chain.

use anchor_watch_primitives::staking::SlashingEvidence;
use anchor_watch_sidechain::SideChain;
use anchor_watch_slasher::EvidenceSink;
use async_trait::async_trait;

/// Delivers evidence through `submitSlashingEvidence`.
#[derive(Debug, Clone)]
pub(crate) struct SideChainSink<S> {
    sidechain: S,
}

impl<S> SideChainSink<S> {
    pub(crate) const fn new(sidechain: S) -> Self {
        Self { sidechain }
    }
}

#[async_trait]
impl<S: SideChain> EvidenceSink for SideChainSink<S> {
    async fn deliver(&self, evidence: &SlashingEvidence) -> Result<(), String> {
        self.sidechain
            .submit_evidence(evidence)
            .await
            .map_err(|e| e.to_string())
    }
}
