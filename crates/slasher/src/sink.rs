//! Destination of slashing evidence.

use anchor_watch_primitives::staking::SlashingEvidence;
use async_trait::async_trait;

/// Receives slashing evidence.
///
/// A failed delivery is retried on every poll round until it succeeds.
#[async_trait]
pub trait EvidenceSink: Send + Sync + 'static {
    /// Hands over `evidence`, returning a description of the failure if it was not accepted.
    async fn deliver(&self, evidence: &SlashingEvidence) -> Result<(), String>;
}
