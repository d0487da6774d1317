//! Slasher settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an unauthorized spend seen only in the mempool is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MempoolSpendPolicy {
    /// Produce evidence as soon as the spend shows up, confirmed or not.
    #[default]
    TreatAsSpent,

    /// Wait until the spend is buried this many blocks deep.
    RequireConfirmations(u32),
}

impl MempoolSpendPolicy {
    /// Confirmations an unauthorized spend needs before evidence is produced.
    pub const fn required_confirmations(&self) -> u32 {
        match self {
            Self::TreatAsSpent => 0,
            Self::RequireConfirmations(n) => *n,
        }
    }
}

/// Slasher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlasherConfig {
    /// Time between two rounds over the protected outputs.
    pub poll_interval: Duration,

    /// Treatment of unconfirmed unauthorized spends.
    #[serde(default)]
    pub mempool_policy: MempoolSpendPolicy,
}

impl Default for SlasherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            mempool_policy: MempoolSpendPolicy::default(),
        }
    }
}
