//! Checkpoint assembly and submission bookkeeping.
//!
//! [`ReporterState`] is a plain state machine: it never performs I/O and is driven by the ingest
//! and submitter workers under a lock that is released before any network call.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use anchor_watch_primitives::{
    block::BlockRef,
    checkpoint::{extract_fragments, Checkpoint, CheckpointFragment, CheckpointId},
};
use bitcoin::{Block, BlockHash};
use tracing::{debug, info, trace, warn};

/// Where a checkpoint stands with respect to the side-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionState {
    /// Some fragments have not been seen yet.
    Incomplete,

    /// Complete and waiting for the submitter.
    Pending,

    /// A submission attempt is in flight.
    Submitted,

    /// The last attempt failed transiently; another one follows.
    Failed(String),

    /// Accepted by the side-chain.
    Acknowledged,

    /// Refused by the side-chain as invalid. Terminal.
    Rejected(String),
}

impl SubmissionState {
    /// Whether the checkpoint is complete but not acknowledged yet.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Submitted | Self::Failed(_))
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete"),
            Self::Pending => write!(f, "pending"),
            Self::Submitted => write!(f, "submitted"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Rejected(reason) => write!(f, "rejected ({reason})"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    total: u8,
    fragments: BTreeMap<u8, CheckpointFragment>,
    state: SubmissionState,
}

/// What processing a block changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// The exact block had already been processed; nothing changed.
    pub duplicate: bool,

    /// The block replaced a previously processed one at the same height.
    pub reorged: bool,

    /// Number of new fragments taken from the block.
    pub accepted: usize,

    /// Number of tagged outputs that could not be parsed.
    pub malformed: usize,

    /// Checkpoints the block completed.
    pub completed: Vec<CheckpointId>,

    /// Checkpoints that lost fragments to the reorg and became incomplete again.
    pub reverted: Vec<CheckpointId>,
}

/// Counts describing the reporter's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Checkpoints with fragments still missing.
    pub incomplete: usize,

    /// Complete checkpoints not acknowledged yet.
    pub pending: usize,

    /// Checkpoints accepted by the side-chain.
    pub acknowledged: usize,

    /// Checkpoints refused by the side-chain.
    pub rejected: usize,
}

/// Fragments, checkpoints and their submission records.
#[derive(Debug)]
pub struct ReporterState {
    tag: Vec<u8>,
    depth: usize,

    /// Recently processed blocks, used to recognize duplicates and replaced blocks.
    window: BTreeMap<u64, BlockHash>,
    last_processed: Option<BlockRef>,

    entries: BTreeMap<CheckpointId, Entry>,
    acknowledged: BTreeSet<CheckpointId>,
    rejected: BTreeMap<CheckpointId, String>,
}

impl ReporterState {
    /// Creates an empty state recognizing fragments tagged with `tag` and remembering the last
    /// `depth + 1` blocks.
    pub fn new(tag: impl Into<Vec<u8>>, depth: usize) -> Self {
        Self {
            tag: tag.into(),
            depth,
            window: BTreeMap::new(),
            last_processed: None,
            entries: BTreeMap::new(),
            acknowledged: BTreeSet::new(),
            rejected: BTreeMap::new(),
        }
    }

    /// The most recently processed block of the best chain.
    pub const fn last_processed(&self) -> Option<BlockRef> {
        self.last_processed
    }

    /// Feeds a block through fragment extraction and assembly.
    ///
    /// Delivering the same block twice is a no-op. A block replacing a remembered one at the same
    /// height first invalidates every fragment taken from the replaced block and the blocks above
    /// it.
    pub fn process_block(&mut self, height: u64, block: &Block) -> BlockOutcome {
        let hash = block.block_hash();
        let mut outcome = BlockOutcome::default();

        match self.window.get(&height) {
            Some(known) if *known == hash => {
                trace!(%height, %hash, "block already processed");
                outcome.duplicate = true;
                return outcome;
            }
            Some(replaced) => {
                warn!(%height, %replaced, new = %hash, "processed block was replaced");
                outcome.reorged = true;
                outcome.reverted = self.orphan_from(height);
            }
            None => {}
        }

        if self.tracks_height(height) {
            self.window.insert(height, hash);
            while self.window.len() > self.depth + 1 {
                self.window.pop_first();
            }
        }

        let newer = self
            .last_processed
            .map_or(true, |last| height >= last.height);
        if newer || outcome.reorged {
            self.last_processed = Some(BlockRef::new(height, hash));
        }

        let extracted = extract_fragments(&self.tag, BlockRef::new(height, hash), block);
        for bad in &extracted.malformed {
            warn!(txid = %bad.txid, vout = bad.vout, error = %bad.error, %height, "skipping malformed checkpoint fragment");
        }
        outcome.malformed = extracted.malformed.len();

        for fragment in extracted.fragments {
            let id = fragment.id();
            match self.add_fragment(fragment) {
                FragmentOutcome::Completed => {
                    outcome.accepted += 1;
                    outcome.completed.push(id);
                }
                FragmentOutcome::Accepted => outcome.accepted += 1,
                FragmentOutcome::Ignored => {}
            }
        }

        outcome
    }

    /// Blocks below a full window are historical (e.g. rescanned) and do not enter it.
    fn tracks_height(&self, height: u64) -> bool {
        self.window.len() <= self.depth
            || self
                .window
                .first_key_value()
                .map_or(true, |(first, _)| height >= *first)
    }

    /// Forgets the blocks at and above `height` and the fragments taken from them.
    ///
    /// Returns the checkpoints that were complete and no longer are.
    fn orphan_from(&mut self, height: u64) -> Vec<CheckpointId> {
        let orphaned: BTreeSet<BlockHash> = self.window.split_off(&height).into_values().collect();
        let mut reverted = Vec::new();

        self.entries.retain(|id, entry| {
            let before = entry.fragments.len();
            entry
                .fragments
                .retain(|_, fragment| !orphaned.contains(&fragment.source.block.hash));

            if entry.fragments.len() != before && entry.state != SubmissionState::Incomplete {
                info!(%id, previous = %entry.state, "checkpoint lost fragments to a reorg");
                entry.state = SubmissionState::Incomplete;
                reverted.push(*id);
            }

            !entry.fragments.is_empty()
        });

        reverted
    }

    fn add_fragment(&mut self, fragment: CheckpointFragment) -> FragmentOutcome {
        let id = fragment.id();
        let index = fragment.index();

        if self.acknowledged.contains(&id) || self.rejected.contains_key(&id) {
            debug!(%id, %index, "ignoring fragment of a finished checkpoint");
            return FragmentOutcome::Ignored;
        }

        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            total: fragment.header.total,
            fragments: BTreeMap::new(),
            state: SubmissionState::Incomplete,
        });

        if entry.total != fragment.header.total {
            warn!(%id, %index, expected = entry.total, got = fragment.header.total, txid = %fragment.source.txid, "ignoring fragment with mismatched total");
            return FragmentOutcome::Ignored;
        }

        match entry.fragments.get(&index) {
            Some(existing) if existing.same_content(&fragment) => {
                trace!(%id, %index, "fragment already known");
                return FragmentOutcome::Ignored;
            }
            Some(existing) => {
                warn!(%id, %index, existing = %existing.source.txid, conflicting = %fragment.source.txid, "ignoring conflicting fragment");
                return FragmentOutcome::Ignored;
            }
            None => {}
        }

        debug!(%id, %index, total = entry.total, block = %fragment.source.block, "accepted checkpoint fragment");
        entry.fragments.insert(index, fragment);

        if entry.state == SubmissionState::Incomplete
            && entry.fragments.len() == usize::from(entry.total)
        {
            info!(%id, "checkpoint complete");
            entry.state = SubmissionState::Pending;
            return FragmentOutcome::Completed;
        }

        FragmentOutcome::Accepted
    }

    /// Takes the lowest pending checkpoint, marks it submitted and assembles it.
    pub fn begin_submission(&mut self) -> Option<Checkpoint> {
        for (id, entry) in self.entries.iter_mut() {
            if entry.state != SubmissionState::Pending {
                continue;
            }

            match Checkpoint::assemble(*id, entry.total, &entry.fragments) {
                Some(checkpoint) => {
                    entry.state = SubmissionState::Submitted;
                    return Some(checkpoint);
                }
                None => {
                    warn!(%id, "pending checkpoint is missing fragments");
                    entry.state = SubmissionState::Incomplete;
                }
            }
        }

        None
    }

    /// Marks the start of a submission attempt for `id`.
    ///
    /// Returns `Some(true)` when a previous attempt failed, `Some(false)` for the first attempt
    /// and `None` when the checkpoint is no longer being submitted.
    pub fn begin_attempt(&mut self, id: CheckpointId) -> Option<bool> {
        let entry = self.entries.get_mut(&id)?;

        match entry.state {
            SubmissionState::Submitted => Some(false),
            SubmissionState::Failed(_) => {
                entry.state = SubmissionState::Submitted;
                Some(true)
            }
            _ => None,
        }
    }

    /// Records a transient failure of the attempt in flight for `id`.
    pub fn record_failure(&mut self, id: CheckpointId, reason: String) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.state == SubmissionState::Submitted {
                entry.state = SubmissionState::Failed(reason);
            }
        }
    }

    /// Archives `id` as acknowledged.
    ///
    /// This holds even if a reorg invalidated its fragments meanwhile: the side-chain accepted it.
    pub fn record_ack(&mut self, id: CheckpointId) {
        self.entries.remove(&id);
        self.acknowledged.insert(id);
    }

    /// Archives `id` as rejected.
    pub fn record_rejection(&mut self, id: CheckpointId, reason: String) {
        self.entries.remove(&id);
        self.rejected.insert(id, reason);
    }

    /// The submission record of `id`, if the checkpoint was ever seen.
    pub fn state_of(&self, id: CheckpointId) -> Option<SubmissionState> {
        if self.acknowledged.contains(&id) {
            return Some(SubmissionState::Acknowledged);
        }
        if let Some(reason) = self.rejected.get(&id) {
            return Some(SubmissionState::Rejected(reason.clone()));
        }

        self.entries.get(&id).map(|entry| entry.state.clone())
    }

    /// Tallies the checkpoints by state.
    pub fn counts(&self) -> Counts {
        let (pending, incomplete) = self
            .entries
            .values()
            .fold((0, 0), |(pending, incomplete), entry| {
                if entry.state.is_pending() {
                    (pending + 1, incomplete)
                } else {
                    (pending, incomplete + 1)
                }
            });

        Counts {
            incomplete,
            pending,
            acknowledged: self.acknowledged.len(),
            rejected: self.rejected.len(),
        }
    }
}

enum FragmentOutcome {
    Accepted,
    Completed,
    Ignored,
}
