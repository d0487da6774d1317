//! The JSON-RPC interface of the side-chain node.

use anchor_watch_primitives::checkpoint::CheckpointId;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

use crate::types::{
    RpcAnchorTx, RpcCheckpoint, RpcCheckpointStatus, RpcSlashingEvidence, RpcSubmitOutcome,
};

/// Error code the side-chain uses for structurally invalid requests.
pub const MALFORMED_ERROR_CODE: i32 = -32010;

/// RPCs served by the side-chain node.
#[rpc(client, server, namespace = "sidechain")]
pub trait SideChainApi {
    /// Submits a checkpoint read off the base chain.
    #[method(name = "submitCheckpoint")]
    async fn submit_checkpoint(&self, checkpoint: RpcCheckpoint) -> RpcResult<RpcSubmitOutcome>;

    /// Queries what the side-chain knows about a checkpoint.
    #[method(name = "checkpointStatus")]
    async fn checkpoint_status(&self, id: CheckpointId) -> RpcResult<RpcCheckpointStatus>;

    /// Lists the signed transactions waiting to be anchored on the base chain.
    #[method(name = "pendingAnchors")]
    async fn pending_anchors(&self) -> RpcResult<Vec<RpcAnchorTx>>;

    /// Hands over slashing evidence.
    #[method(name = "submitSlashingEvidence")]
    async fn submit_slashing_evidence(&self, evidence: RpcSlashingEvidence) -> RpcResult<()>;
}
