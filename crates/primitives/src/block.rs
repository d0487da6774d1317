//! References to base-chain blocks.

use std::fmt;

use bitcoin::{Block, BlockHash};
use serde::{Deserialize, Serialize};

/// Identifies a block by its height and hash.
///
/// Two deliveries of the same block compare equal; a competing block at the same height does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef {
    /// Height of the block.
    pub height: u64,

    /// Hash of the block.
    pub hash: BlockHash,
}

impl BlockRef {
    /// Creates a new block reference.
    pub const fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Builds a reference to `block` at `height`.
    pub fn of(height: u64, block: &Block) -> Self {
        Self::new(height, block.block_hash())
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}
