//! Types for the RPC server.

use std::time::Duration;

use anchor_watch_primitives::staking::{AuthorizedSpend, OutputKind};
use serde::{Deserialize, Serialize};

/// State of the connection to the bitcoin node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RpcConnectionStatus {
    /// Performing the initial handshake.
    Connecting,

    /// The node is reachable.
    Connected,

    /// Degraded: the connection was lost and is being re-established.
    Reconnecting {
        /// Consecutive failed attempts.
        attempts: u32,

        /// Time until the next attempt.
        retry_in: Duration,
    },

    /// The client was shut down.
    Stopped,
}

/// Progress of the checkpoint reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReporterStatus {
    /// Height of the last block fed through the pipeline, if any.
    pub last_processed_height: Option<u64>,

    /// Complete checkpoints not yet acknowledged by the side-chain.
    pub pending_checkpoints: usize,

    /// Checkpoints still waiting for fragments.
    pub incomplete_checkpoints: usize,

    /// Checkpoints acknowledged by the side-chain.
    pub acknowledged_checkpoints: usize,

    /// Checkpoints the side-chain rejected as malformed.
    pub rejected_checkpoints: usize,

    /// State of the connection to the bitcoin node.
    pub connection: RpcConnectionStatus,
}

/// Number of protected outputs in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSlasherStatus {
    /// Outputs under surveillance.
    pub tracked: usize,

    /// Outputs spent outside their authorized path.
    pub terminal: usize,

    /// Outputs withdrawn through an authorized path.
    pub withdrawn: usize,

    /// Slashing evidence not yet delivered.
    pub pending_evidence: usize,
}

/// An output to put under slashing surveillance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcProtectedOutput {
    /// Consensus-encoded transaction creating the output.
    #[serde(with = "hex::serde")]
    pub staking_tx: Vec<u8>,

    /// Index of the output in `staking_tx`.
    pub vout: u32,

    /// What the output secures.
    pub kind: OutputKind,

    /// The spending paths that are not slashable.
    #[serde(default)]
    pub authorized: AuthorizedSpend,
}
