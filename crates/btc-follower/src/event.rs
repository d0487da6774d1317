//! Events published by the client.
use std::time::Duration;

use anchor_watch_primitives::block::BlockRef;
use bitcoin::Block;
use serde::{Deserialize, Serialize};

/// BlockEvent is emitted to subscriptions created with
/// [`crate::client::BtcClient::subscribe_blocks`] for every block of the best chain.
///
/// Events arrive in ascending height order within a session. After a reconnect or a reorg the
/// same height may be delivered again, with the same or with a different block, so consumers must
/// deduplicate on height and hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    /// Height of the block.
    pub height: u64,

    /// The block itself.
    pub block: Block,
}

impl BlockEvent {
    /// Height and hash of the block.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::of(self.height, &self.block)
    }
}

/// State of the connection to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionStatus {
    /// Performing the initial handshake.
    Connecting,

    /// The last request succeeded.
    Connected,

    /// The connection was lost and the client is waiting to retry.
    Reconnecting {
        /// Consecutive failed attempts.
        attempts: u32,

        /// Time until the next attempt.
        retry_in: Duration,
    },

    /// The client was shut down.
    Stopped,
}

impl ConnectionStatus {
    /// Whether the node is currently reachable.
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}
