//! Cheap handle for observing and feeding a running slasher.

use std::sync::Arc;

use anchor_watch_common::metrics::SlasherMetrics;
use anchor_watch_primitives::staking::ProtectedOutput;
use parking_lot::Mutex;
use tracing::info;

use crate::{errors::SlasherError, state::SlasherState};

/// Snapshot of the slasher's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlasherStatus {
    /// Outputs under surveillance.
    pub tracked: usize,

    /// Outputs spent outside their authorized path.
    pub terminal: usize,

    /// Outputs withdrawn through an authorized path.
    pub withdrawn: usize,

    /// Evidence not yet delivered.
    pub pending_evidence: usize,
}

/// Handle on a [`crate::Slasher`] that does not depend on its client types.
#[derive(Debug, Clone)]
pub struct SlasherHandle {
    pub(crate) state: Arc<Mutex<SlasherState>>,
    pub(crate) metrics: SlasherMetrics,
}

impl SlasherHandle {
    /// Current progress.
    pub fn status(&self) -> SlasherStatus {
        let counts = self.state.lock().counts();

        SlasherStatus {
            tracked: counts.tracked,
            terminal: counts.terminal,
            withdrawn: counts.withdrawn,
            pending_evidence: counts.pending_evidence,
        }
    }

    /// Puts `output` under surveillance, starting with the next poll round.
    pub fn register(&self, output: ProtectedOutput) -> Result<(), SlasherError> {
        let outpoint = output.outpoint;
        let kind = output.kind;

        let tracked = {
            let mut state = self.state.lock();
            state.register(output)?;
            state.counts().tracked
        };

        self.metrics.protected_outputs_tracked.set(tracked as i64);
        info!(%outpoint, %kind, "protected output registered");

        Ok(())
    }
}
