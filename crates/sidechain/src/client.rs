//! Per-call access to the side-chain node.
//!
//! The client keeps no connection state. Every failure is classified as either transient, in
//! which case the caller retries with its own backoff, or malformed, which is terminal for the
//! item that was sent.

use std::{fmt, time::Duration};

use anchor_watch_primitives::{
    checkpoint::{Checkpoint, CheckpointId},
    staking::SlashingEvidence,
};
use async_trait::async_trait;
use jsonrpsee::{
    core::ClientError,
    http_client::{HttpClient, HttpClientBuilder},
    types::error::INVALID_PARAMS_CODE,
};
use thiserror::Error;
use tracing::trace;

use crate::{
    traits::{SideChainApiClient, MALFORMED_ERROR_CODE},
    types::{RpcAnchorTx, RpcCheckpointStatus, RpcSubmitOutcome},
};

/// Result type of every side-chain call.
pub type SideChainResult<T> = Result<T, SideChainError>;

/// Errors returned by side-chain calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SideChainError {
    /// The node could not be reached, timed out or failed internally.
    #[error("side-chain unavailable: {0}")]
    Transient(String),

    /// The node refused the request as structurally invalid.
    #[error("side-chain rejected the request: {0}")]
    Malformed(String),
}

impl SideChainError {
    /// Whether the same request may succeed later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ClientError> for SideChainError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Call(obj)
                if obj.code() == MALFORMED_ERROR_CODE || obj.code() == INVALID_PARAMS_CODE =>
            {
                Self::Malformed(obj.message().to_owned())
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

/// The side-chain calls the watchers make.
#[async_trait]
pub trait SideChain: Send + Sync + 'static {
    /// Submits an assembled checkpoint.
    async fn submit_checkpoint(&self, checkpoint: &Checkpoint)
        -> SideChainResult<RpcSubmitOutcome>;

    /// Asks what the side-chain knows about checkpoint `id`.
    async fn checkpoint_status(&self, id: CheckpointId) -> SideChainResult<RpcCheckpointStatus>;

    /// Signed transactions waiting to be anchored on the base chain.
    async fn pending_anchors(&self) -> SideChainResult<Vec<RpcAnchorTx>>;

    /// Hands over slashing evidence.
    async fn submit_evidence(&self, evidence: &SlashingEvidence) -> SideChainResult<()>;
}

/// JSON-RPC client of the side-chain node.
#[derive(Clone)]
pub struct SideChainClient {
    client: HttpClient,
    url: String,
}

impl fmt::Debug for SideChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideChainClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl SideChainClient {
    /// Builds a client for `url`. No request is made.
    pub fn new(url: &str, timeout: Duration) -> SideChainResult<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)
            .map_err(|e| SideChainError::Malformed(format!("invalid side-chain url {url}: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// The endpoint this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SideChain for SideChainClient {
    async fn submit_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> SideChainResult<RpcSubmitOutcome> {
        trace!(id = %checkpoint.id, payload = %hex::encode(&checkpoint.payload), "submitting checkpoint");

        Ok(SideChainApiClient::submit_checkpoint(&self.client, checkpoint.into()).await?)
    }

    async fn checkpoint_status(&self, id: CheckpointId) -> SideChainResult<RpcCheckpointStatus> {
        Ok(SideChainApiClient::checkpoint_status(&self.client, id).await?)
    }

    async fn pending_anchors(&self) -> SideChainResult<Vec<RpcAnchorTx>> {
        Ok(SideChainApiClient::pending_anchors(&self.client).await?)
    }

    async fn submit_evidence(&self, evidence: &SlashingEvidence) -> SideChainResult<()> {
        Ok(SideChainApiClient::submit_slashing_evidence(&self.client, evidence.into()).await?)
    }
}
