//! Bookkeeping of the blocks delivered to subscribers.

use std::collections::BTreeMap;

use bitcoin::BlockHash;

/// Remembers the most recently delivered blocks and the next height to deliver.
///
/// The window holds at most `depth + 1` entries. When the follower suspects the chain changed, it
/// pops entries from the top until the remembered hash matches the node again; the height after
/// the last surviving entry is where delivery resumes.
#[derive(Debug, Clone)]
pub(crate) struct ChainCursor {
    window: BTreeMap<u64, BlockHash>,
    depth: usize,
    next_height: u64,
}

impl ChainCursor {
    pub(crate) const fn new(next_height: u64, depth: usize) -> Self {
        Self {
            window: BTreeMap::new(),
            depth,
            next_height,
        }
    }

    /// The next height to deliver.
    pub(crate) const fn next_height(&self) -> u64 {
        self.next_height
    }

    /// The most recently delivered block.
    pub(crate) fn last(&self) -> Option<(u64, BlockHash)> {
        self.window
            .last_key_value()
            .map(|(height, hash)| (*height, *hash))
    }

    /// The hash delivered at `height`, if still remembered.
    pub(crate) fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.window.get(&height).copied()
    }

    /// Records the delivery of `hash` at `height`.
    ///
    /// Anything remembered at or above `height` is forgotten first.
    pub(crate) fn record(&mut self, height: u64, hash: BlockHash) {
        self.window.retain(|h, _| *h < height);
        self.window.insert(height, hash);
        self.next_height = height + 1;

        while self.window.len() > self.depth + 1 {
            self.window.pop_first();
        }
    }

    /// Forgets the most recently delivered block and rewinds to its height.
    pub(crate) fn pop(&mut self) -> Option<(u64, BlockHash)> {
        let popped = self.window.pop_last();
        if let Some((height, _)) = popped {
            self.next_height = height;
        }
        popped
    }
}
