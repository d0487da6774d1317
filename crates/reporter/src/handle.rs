//! Cheap handle for observing and steering a running reporter.

use std::sync::Arc;

use anchor_watch_primitives::{block::BlockRef, checkpoint::CheckpointId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    errors::ReporterError,
    state::{ReporterState, SubmissionState},
};

/// A request to feed the blocks `from..=to` through the pipeline again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RescanRequest {
    pub(crate) from: u64,
    pub(crate) to: u64,
}

/// Snapshot of the reporter's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStatus {
    /// The most recently processed block.
    pub last_processed: Option<BlockRef>,

    /// Complete checkpoints not yet acknowledged.
    pub pending_checkpoints: usize,

    /// Checkpoints with fragments still missing.
    pub incomplete_checkpoints: usize,

    /// Checkpoints acknowledged by the side-chain.
    pub acknowledged_checkpoints: usize,

    /// Checkpoints rejected by the side-chain.
    pub rejected_checkpoints: usize,
}

/// Handle on a [`crate::Reporter`] that does not depend on the side-chain client type.
#[derive(Debug, Clone)]
pub struct ReporterHandle {
    pub(crate) state: Arc<Mutex<ReporterState>>,
    pub(crate) rescans: mpsc::UnboundedSender<RescanRequest>,
    pub(crate) max_rescan_range: u64,
}

impl ReporterHandle {
    /// Current progress.
    pub fn status(&self) -> ReporterStatus {
        let state = self.state.lock();
        let counts = state.counts();

        ReporterStatus {
            last_processed: state.last_processed(),
            pending_checkpoints: counts.pending,
            incomplete_checkpoints: counts.incomplete,
            acknowledged_checkpoints: counts.acknowledged,
            rejected_checkpoints: counts.rejected,
        }
    }

    /// The submission record of checkpoint `id`, if it was ever seen.
    pub fn submission_state(&self, id: CheckpointId) -> Option<SubmissionState> {
        self.state.lock().state_of(id)
    }

    /// Asks the ingest worker to re-fetch the blocks `from..=to` and process them again.
    pub fn request_rescan(&self, from: u64, to: u64) -> Result<(), ReporterError> {
        if from > to {
            return Err(ReporterError::InvalidRange { from, to });
        }

        let requested = to - from + 1;
        if requested > self.max_rescan_range {
            return Err(ReporterError::RangeTooLarge {
                requested,
                limit: self.max_rescan_range,
            });
        }

        self.rescans
            .send(RescanRequest { from, to })
            .map_err(|_| ReporterError::NotRunning)?;
        info!(%from, %to, "rescan requested");

        Ok(())
    }
}
