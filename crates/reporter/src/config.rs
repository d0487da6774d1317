//! Reporter settings.

use anchor_watch_common::retry::RetryPolicy;
use anchor_watch_primitives::checkpoint::DEFAULT_CHECKPOINT_TAG;
use serde::{Deserialize, Serialize};

/// Largest block range a single rescan may cover, unless configured otherwise.
pub const DEFAULT_MAX_RESCAN_RANGE: u64 = 10_000;

/// Reporter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Tag prefixing the OP_RETURN data of every checkpoint fragment.
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Backoff used between submission attempts and rescan fetches.
    pub retry: RetryPolicy,

    /// Number of recent blocks remembered to detect reorgs.
    pub reorg_safety_depth: usize,

    /// Largest block range a single rescan may cover.
    #[serde(default = "default_max_rescan_range")]
    pub max_rescan_range: u64,
}

fn default_tag() -> String {
    DEFAULT_CHECKPOINT_TAG.to_string()
}

const fn default_max_rescan_range() -> u64 {
    DEFAULT_MAX_RESCAN_RANGE
}

impl ReporterConfig {
    /// Settings with the default tag and rescan limit.
    pub fn new(retry: RetryPolicy, reorg_safety_depth: usize) -> Self {
        Self {
            tag: default_tag(),
            retry,
            reorg_safety_depth,
            max_rescan_range: DEFAULT_MAX_RESCAN_RANGE,
        }
    }

    /// Overrides the fragment tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}
