//! The poll loop over protected outputs.
//!
//! Each round checks every tracked output without holding the state lock, decides what an
//! observed spend means, and then tries to deliver the evidence still waiting for the sink.

use std::{fmt, sync::Arc};

use anchor_watch_common::metrics::SlasherMetrics;
use anchor_watch_primitives::staking::{ProtectedOutput, SlashingEvidence, SpendLocation};
use bitcoin::{OutPoint, Transaction, Txid};
use btc_follower::{client::BtcClient, rpc::Reader};
use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SlasherConfig,
    errors::SlasherError,
    handle::SlasherHandle,
    sink::EvidenceSink,
    spendable::is_output_spendable,
    state::SlasherState,
};

/// What a round found out about one output.
#[derive(Debug)]
enum Verdict {
    Unspent,

    /// Spent, but the spender is not visible in the mempool or the searched blocks.
    SpenderUnknown,

    /// Spent, not buried deep enough to act on yet.
    Waiting { spender: Txid, confirmations: u32 },

    Withdrawn { spender: Txid },

    Slash(SlashingEvidence),
}

/// Watches protected outputs and reports unauthorized spends to an [`EvidenceSink`].
pub struct Slasher<R, K> {
    btc: BtcClient<R>,
    sink: K,
    cfg: SlasherConfig,
    state: Arc<Mutex<SlasherState>>,
    metrics: SlasherMetrics,
}

impl<R, K> fmt::Debug for Slasher<R, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slasher")
            .field("cfg", &self.cfg)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl<R: Reader, K: EvidenceSink> Slasher<R, K> {
    /// Creates a slasher with no protected outputs.
    pub fn new(btc: BtcClient<R>, sink: K, cfg: SlasherConfig, metrics: SlasherMetrics) -> Self {
        Self {
            btc,
            sink,
            cfg,
            state: Arc::new(Mutex::new(SlasherState::default())),
            metrics,
        }
    }

    /// A handle for status queries and registrations.
    pub fn handle(&self) -> SlasherHandle {
        SlasherHandle {
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Runs poll rounds until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(policy = ?self.cfg.mempool_policy, "slasher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once(&cancel).await,
            }
        }

        info!("slasher exiting");
    }

    /// Checks every tracked output once, then retries pending evidence deliveries.
    pub async fn poll_once(&self, cancel: &CancellationToken) {
        let outputs = self.state.lock().snapshot();

        for output in outputs {
            if cancel.is_cancelled() {
                return;
            }

            let outpoint = output.outpoint;
            match self.check(&output).await {
                Ok(Verdict::Unspent) => {}
                Ok(Verdict::SpenderUnknown) => {
                    warn!(%outpoint, "protected output spent but spender not found");
                }
                Ok(Verdict::Waiting {
                    spender,
                    confirmations,
                }) => {
                    debug!(%outpoint, %spender, %confirmations, "waiting for spend to be buried");
                }
                Ok(Verdict::Withdrawn { spender }) => {
                    if self.state.lock().withdraw(&outpoint) {
                        info!(%outpoint, %spender, "protected output withdrawn through authorized path");
                    }
                }
                Ok(Verdict::Slash(evidence)) => {
                    let spender = evidence.spending_txid();
                    let spent_at = evidence.spent_at;
                    if self.state.lock().slash(evidence) {
                        self.metrics.evidence_produced.inc();
                        error!(%outpoint, kind = %output.kind, %spender, %spent_at, "protected output spent outside authorized path");
                    }
                }
                Err(err) => warn!(%outpoint, %err, "could not check protected output"),
            }
        }

        self.deliver_evidence().await;
        self.refresh_gauges();
    }

    async fn check(&self, output: &ProtectedOutput) -> Result<Verdict, SlasherError> {
        let outpoint = output.outpoint;

        if is_output_spendable(self.btc.rpc(), &output.staking_tx, outpoint.vout).await? {
            self.state.lock().forget_spend(&outpoint);
            return Ok(Verdict::Unspent);
        }

        let Some((spending_tx, location)) = self.locate_spender(&outpoint).await? else {
            return Ok(Verdict::SpenderUnknown);
        };
        let spender = spending_tx.compute_txid();

        let confirmations = match location {
            SpendLocation::Mempool => 0,
            SpendLocation::Block(block) => {
                let tip = self.btc.get_block_count().await?;
                u32::try_from(tip.saturating_sub(block.height) + 1).unwrap_or(u32::MAX)
            }
        };

        let required = self.cfg.mempool_policy.required_confirmations();

        // an authorized spend only retires the output once it is mined
        if output.authorized.authorizes(&spending_tx, &outpoint) {
            return Ok(if confirmations >= required.max(1) {
                Verdict::Withdrawn { spender }
            } else {
                Verdict::Waiting {
                    spender,
                    confirmations,
                }
            });
        }

        if confirmations < required {
            return Ok(Verdict::Waiting {
                spender,
                confirmations,
            });
        }

        Ok(Verdict::Slash(SlashingEvidence::new(
            output,
            spending_tx,
            location,
        )))
    }

    /// Finds the spender of `outpoint`, preferring the mined spend seen in an earlier round.
    ///
    /// A remembered spend is used as long as its block is still on the best chain, so that a
    /// spend buried below the search depth keeps gaining confirmations.
    async fn locate_spender(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<(Transaction, SpendLocation)>, SlasherError> {
        let remembered = self.state.lock().mined_spend(outpoint);

        if let Some((spender, block)) = remembered {
            match self.btc.rpc().get_block_hash(block.height).await {
                Ok(hash) if hash == block.hash => {
                    return Ok(Some((spender, SpendLocation::Block(block))));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }

            debug!(%outpoint, %block, "remembered spend reorganized away");
            self.state.lock().forget_spend(outpoint);
        }

        let found = self.btc.find_spender(*outpoint).await?;
        if let Some((spender, SpendLocation::Block(block))) = &found {
            self.state
                .lock()
                .remember_spend(*outpoint, spender.clone(), *block);
        }

        Ok(found)
    }

    /// Delivers pending evidence in order, stopping at the first failure.
    async fn deliver_evidence(&self) {
        loop {
            let next = self.state.lock().next_evidence();
            let Some(evidence) = next else {
                return;
            };

            match self.sink.deliver(&evidence).await {
                Ok(()) => {
                    self.state.lock().evidence_delivered();
                    self.metrics.evidence_delivered.inc();
                    info!(outpoint = %evidence.protected, spender = %evidence.spending_txid(), "slashing evidence delivered");
                }
                Err(err) => {
                    warn!(outpoint = %evidence.protected, %err, "could not deliver slashing evidence, retrying next round");
                    return;
                }
            }
        }
    }

    fn refresh_gauges(&self) {
        let counts = self.state.lock().counts();

        self.metrics
            .protected_outputs_tracked
            .set(counts.tracked as i64);
        self.metrics
            .protected_outputs_terminal
            .set(counts.terminal as i64);
    }
}
