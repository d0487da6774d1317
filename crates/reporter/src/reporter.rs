//! The ingest and submitter workers.

use std::{fmt, sync::Arc};

use anchor_watch_common::{
    metrics::ReporterMetrics,
    retry::{retry_with, RetryAction, RetryError},
};
use anchor_watch_primitives::checkpoint::Checkpoint;
use anchor_watch_sidechain::{
    types::{RpcCheckpointStatus, RpcSubmitOutcome},
    SideChain,
};
use bitcoin::Block;
use btc_follower::{
    client::BtcClient,
    event::BlockEvent,
    rpc::{ClientError, Reader},
    subscription::Subscription,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ReporterConfig,
    errors::ReporterError,
    handle::{ReporterHandle, RescanRequest},
    state::ReporterState,
};

struct Inner<S> {
    cfg: ReporterConfig,
    sidechain: S,
    state: Arc<Mutex<ReporterState>>,
    metrics: ReporterMetrics,
    wake: Notify,
    rescan_tx: mpsc::UnboundedSender<RescanRequest>,
    rescan_rx: Mutex<Option<mpsc::UnboundedReceiver<RescanRequest>>>,
}

/// Reports the checkpoints found on the base chain to the side-chain.
///
/// Clones share the same state. Run exactly one ingest worker ([`Self::run_ingest`]) and one
/// submitter worker ([`Self::run_submitter`]).
pub struct Reporter<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Reporter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for Reporter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("cfg", &self.inner.cfg)
            .finish_non_exhaustive()
    }
}

impl<S: SideChain> Reporter<S> {
    /// Creates a reporter with empty state.
    pub fn new(cfg: ReporterConfig, sidechain: S, metrics: ReporterMetrics) -> Self {
        let state = ReporterState::new(cfg.tag.as_bytes(), cfg.reorg_safety_depth);
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                cfg,
                sidechain,
                state: Arc::new(Mutex::new(state)),
                metrics,
                wake: Notify::new(),
                rescan_tx,
                rescan_rx: Mutex::new(Some(rescan_rx)),
            }),
        }
    }

    /// A handle for status queries and rescans.
    pub fn handle(&self) -> ReporterHandle {
        ReporterHandle {
            state: self.inner.state.clone(),
            rescans: self.inner.rescan_tx.clone(),
            max_rescan_range: self.inner.cfg.max_rescan_range,
        }
    }

    /// Feeds one block through the pipeline and wakes the submitter if it completed checkpoints.
    pub fn ingest_block(&self, height: u64, block: &Block) {
        let outcome = self.inner.state.lock().process_block(height, block);

        if outcome.duplicate {
            return;
        }

        self.inner.metrics.blocks_processed.inc();
        if outcome.reorged {
            self.inner.metrics.reorgs_detected.inc();
            warn!(%height, reverted = ?outcome.reverted, "reorg invalidated checkpoint fragments");
        }
        debug!(%height, fragments = outcome.accepted, completed = ?outcome.completed, malformed = outcome.malformed, "processed block");

        if !outcome.completed.is_empty() {
            self.inner.wake.notify_one();
        }
        self.refresh_gauges();
    }

    /// Consumes `blocks` and rescan requests until cancelled or the subscription closes.
    pub async fn run_ingest<R: Reader>(
        self,
        btc: BtcClient<R>,
        mut blocks: Subscription<BlockEvent>,
        cancel: CancellationToken,
    ) {
        let Some(mut rescans) = self.inner.rescan_rx.lock().take() else {
            error!("reporter ingest worker is already running");
            return;
        };
        info!("reporter ingest worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(request) = rescans.recv() => self.rescan(&btc, request, &cancel).await,
                event = blocks.next() => match event {
                    Some(event) => self.ingest_block(event.height, &event.block),
                    None => {
                        info!("block subscription closed");
                        break;
                    }
                },
            }
        }

        info!("reporter ingest worker exiting");
    }

    async fn rescan<R: Reader>(
        &self,
        btc: &BtcClient<R>,
        request: RescanRequest,
        cancel: &CancellationToken,
    ) {
        info!(from = request.from, to = request.to, "rescanning blocks");

        for height in request.from..=request.to {
            let fetched = retry_with(
                self.inner.cfg.retry,
                cancel,
                |err: &ClientError, _| {
                    if err.is_transient() {
                        RetryAction::Retry
                    } else {
                        RetryAction::Stop
                    }
                },
                || btc.get_block_at(height),
            )
            .await;

            match fetched {
                Ok(event) => self.ingest_block(event.height, &event.block),
                Err(RetryError::Stopped(err)) => {
                    warn!(%height, %err, "stopping rescan");
                    return;
                }
                Err(RetryError::Cancelled) => return,
            }
        }

        info!(from = request.from, to = request.to, "rescan finished");
    }

    /// Submits complete checkpoints one at a time until cancelled.
    pub async fn run_submitter(self, cancel: CancellationToken) {
        info!("reporter submitter worker started");

        loop {
            let next = self.inner.state.lock().begin_submission();

            let Some(checkpoint) = next else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.inner.wake.notified() => {}
                }
                continue;
            };

            self.refresh_gauges();
            if !self.submit(checkpoint, &cancel).await {
                break;
            }
        }

        info!("reporter submitter worker exiting");
    }

    /// Drives one checkpoint to a final answer. Returns `false` if cancelled.
    async fn submit(&self, checkpoint: Checkpoint, cancel: &CancellationToken) -> bool {
        let id = checkpoint.id;
        debug!(%id, size = checkpoint.payload.len(), "submitting checkpoint");

        let result = retry_with(
            self.inner.cfg.retry,
            cancel,
            |err: &ReporterError, _| {
                if err.is_transient() {
                    RetryAction::Retry
                } else {
                    RetryAction::Stop
                }
            },
            || self.attempt(&checkpoint),
        )
        .await;

        match result {
            Ok(outcome) => {
                self.inner.state.lock().record_ack(id);
                self.inner.metrics.checkpoints_acknowledged.inc();
                info!(%id, ?outcome, "checkpoint acknowledged");
            }
            Err(RetryError::Stopped(ReporterError::Superseded(_))) => {
                info!(%id, "checkpoint invalidated by a reorg, waiting for its fragments");
            }
            Err(RetryError::Stopped(err)) => {
                self.inner.state.lock().record_rejection(id, err.to_string());
                self.inner.metrics.checkpoints_rejected.inc();
                error!(%id, %err, "checkpoint rejected");
            }
            Err(RetryError::Cancelled) => {
                debug!(%id, "submission cancelled");
                return false;
            }
        }

        self.refresh_gauges();
        true
    }

    async fn attempt(&self, checkpoint: &Checkpoint) -> Result<RpcSubmitOutcome, ReporterError> {
        let id = checkpoint.id;

        let retrying = self
            .inner
            .state
            .lock()
            .begin_attempt(id)
            .ok_or(ReporterError::Superseded(id))?;

        if retrying {
            let status = self
                .inner
                .sidechain
                .checkpoint_status(id)
                .await
                .map_err(|err| self.note_failure(checkpoint, err.into()))?;

            match status {
                RpcCheckpointStatus::Accepted => {
                    debug!(%id, "side-chain already accepted the checkpoint");
                    return Ok(RpcSubmitOutcome::AlreadyKnown);
                }
                RpcCheckpointStatus::Rejected { reason } => {
                    return Err(ReporterError::Rejected(reason));
                }
                RpcCheckpointStatus::Unknown | RpcCheckpointStatus::Pending => {
                    trace!(%id, ?status, "resubmitting checkpoint");
                }
            }
        }

        self.inner.metrics.checkpoints_submitted.inc();
        self.inner
            .sidechain
            .submit_checkpoint(checkpoint)
            .await
            .map_err(|err| self.note_failure(checkpoint, err.into()))
    }

    fn note_failure(&self, checkpoint: &Checkpoint, err: ReporterError) -> ReporterError {
        if err.is_transient() {
            self.inner
                .state
                .lock()
                .record_failure(checkpoint.id, err.to_string());
            self.inner.metrics.checkpoints_failed.inc();
            warn!(id = %checkpoint.id, %err, "checkpoint submission failed");
        }

        err
    }

    fn refresh_gauges(&self) {
        let (counts, last) = {
            let state = self.inner.state.lock();
            (state.counts(), state.last_processed())
        };

        self.inner
            .metrics
            .pending_checkpoints
            .set(counts.pending as i64);
        if let Some(last) = last {
            self.inner
                .metrics
                .last_processed_height
                .set(last.height as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anchor_watch_common::{
        metrics::BtcClientMetrics, retry::RetryPolicy, shutdown::ShutdownCoordinator,
    };
    use anchor_watch_primitives::checkpoint::{split_payload, CheckpointId};
    use anchor_watch_sidechain::{mock::MockSideChain, SideChainError};
    use anchor_watch_test_utils::bitcoin::{generate_block, generate_tx_with_output};
    use bitcoin::{hashes::Hash, BlockHash, ScriptBuf};
    use btc_follower::{config::BtcClientConfig, mock::MockBtcRpc};

    use super::*;
    use crate::state::SubmissionState;

    const TAG: &[u8] = b"awck";

    fn config() -> ReporterConfig {
        ReporterConfig::new(
            RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(16)),
            6,
        )
    }

    fn btc_config() -> BtcClientConfig {
        BtcClientConfig::new("http://127.0.0.1:18443", "user", "password")
            .with_poll_interval(Duration::from_secs(1))
            .with_reorg_safety_depth(6)
    }

    /// A payload that takes exactly three fragments.
    fn three_fragment_payload() -> (Vec<u8>, Vec<ScriptBuf>) {
        let payload: Vec<u8> = (0..150u8).collect();
        let scripts = split_payload(TAG, CheckpointId(1), &payload).unwrap();
        assert_eq!(scripts.len(), 3);
        (payload, scripts)
    }

    fn single_fragment_block(height: u64, id: u64) -> Block {
        let script = split_payload(TAG, CheckpointId(id), b"payload").unwrap().remove(0);
        generate_block(
            height,
            BlockHash::all_zeros(),
            vec![generate_tx_with_output(script)],
        )
    }

    async fn wait_for_state(
        handle: &ReporterHandle,
        id: CheckpointId,
        expected: SubmissionState,
    ) {
        for _ in 0..120 {
            if handle.submission_state(id) == Some(expected.clone()) {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!(
            "checkpoint {id} never reached {expected}, last {:?}",
            handle.submission_state(id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn three_blocks_yield_one_submission() {
        let rpc = MockBtcRpc::new(100);
        let btc = BtcClient::connect(rpc.clone(), btc_config(), BtcClientMetrics::default())
            .await
            .unwrap();
        let sidechain = MockSideChain::new();
        let reporter = Reporter::new(config(), sidechain.clone(), ReporterMetrics::default());
        let handle = reporter.handle();

        let cancel = CancellationToken::new();
        let blocks = btc.subscribe_blocks().await;
        let ingest = tokio::spawn(reporter.clone().run_ingest(btc.clone(), blocks, cancel.clone()));
        let submitter = tokio::spawn(reporter.clone().run_submitter(cancel.clone()));
        btc.start();

        let (payload, scripts) = three_fragment_payload();
        let mut prev = rpc.tip_hash();
        for (height, script) in (101..).zip(scripts) {
            let block = generate_block(height, prev, vec![generate_tx_with_output(script)]);
            prev = block.block_hash();
            rpc.mine(block);

            if height < 103 {
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(
                    handle.submission_state(CheckpointId(1)),
                    Some(SubmissionState::Incomplete)
                );
                assert!(sidechain.submissions().is_empty());
            }
        }

        wait_for_state(&handle, CheckpointId(1), SubmissionState::Acknowledged).await;

        let submissions = sidechain.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].payload, payload);

        let status = handle.status();
        assert_eq!(status.last_processed.unwrap().height, 103);
        assert_eq!(status.acknowledged_checkpoints, 1);
        assert_eq!(status.pending_checkpoints, 0);

        cancel.cancel();
        ingest.await.unwrap();
        submitter.await.unwrap();
        btc.stop();
        btc.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_acknowledged() {
        let sidechain = MockSideChain::new();
        sidechain.fail_next_submits([
            SideChainError::Transient("busy".into()),
            SideChainError::Transient("busy".into()),
        ]);
        let metrics = ReporterMetrics::default();
        let reporter = Reporter::new(config(), sidechain.clone(), metrics.clone());
        let handle = reporter.handle();

        let cancel = CancellationToken::new();
        let submitter = tokio::spawn(reporter.clone().run_submitter(cancel.clone()));
        reporter.ingest_block(101, &single_fragment_block(101, 1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            handle.submission_state(CheckpointId(1)),
            Some(SubmissionState::Failed(_))
        ));

        wait_for_state(&handle, CheckpointId(1), SubmissionState::Acknowledged).await;
        assert_eq!(sidechain.submissions().len(), 1);
        assert_eq!(metrics.checkpoints_failed.get(), 2);
        assert_eq!(metrics.checkpoints_submitted.get(), 3);

        cancel.cancel();
        submitter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn status_check_avoids_resubmission() {
        let sidechain = MockSideChain::new();
        // The first submission reaches the side-chain but the answer is lost.
        sidechain.fail_next_submits([SideChainError::Transient("timeout".into())]);
        sidechain.set_status(CheckpointId(1), RpcCheckpointStatus::Accepted);
        sidechain.set_status(
            CheckpointId(2),
            RpcCheckpointStatus::Rejected {
                reason: "bad signature".into(),
            },
        );

        let reporter = Reporter::new(config(), sidechain.clone(), ReporterMetrics::default());
        let handle = reporter.handle();
        let cancel = CancellationToken::new();
        let submitter = tokio::spawn(reporter.clone().run_submitter(cancel.clone()));

        reporter.ingest_block(101, &single_fragment_block(101, 1));
        wait_for_state(&handle, CheckpointId(1), SubmissionState::Acknowledged).await;
        assert!(sidechain.submissions().is_empty());

        sidechain.fail_next_submits([SideChainError::Transient("timeout".into())]);
        reporter.ingest_block(102, &single_fragment_block(102, 2));
        wait_for_state(
            &handle,
            CheckpointId(2),
            SubmissionState::Rejected("checkpoint rejected by the side-chain: bad signature".into()),
        )
        .await;

        cancel.cancel();
        submitter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_checkpoint_does_not_block_the_next() {
        let sidechain = MockSideChain::new();
        sidechain.fail_next_submits([SideChainError::Malformed("bad proof".into())]);
        let metrics = ReporterMetrics::default();
        let reporter = Reporter::new(config(), sidechain.clone(), metrics.clone());
        let handle = reporter.handle();
        let cancel = CancellationToken::new();
        let submitter = tokio::spawn(reporter.clone().run_submitter(cancel.clone()));

        reporter.ingest_block(101, &single_fragment_block(101, 1));
        reporter.ingest_block(102, &single_fragment_block(102, 2));

        wait_for_state(&handle, CheckpointId(2), SubmissionState::Acknowledged).await;
        assert!(matches!(
            handle.submission_state(CheckpointId(1)),
            Some(SubmissionState::Rejected(_))
        ));
        assert_eq!(metrics.checkpoints_rejected.get(), 1);

        cancel.cancel();
        submitter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_sleeping_retry() {
        let sidechain = MockSideChain::new();
        sidechain.fail_next_submits(
            std::iter::repeat(SideChainError::Transient("down".into())).take(100),
        );
        let reporter = Reporter::new(config(), sidechain, ReporterMetrics::default());
        let handle = reporter.handle();

        let grace = Duration::from_secs(5);
        let mut coordinator = ShutdownCoordinator::new(grace);
        let submitter = reporter.clone();
        coordinator.spawn("submitter", move |cancel| submitter.run_submitter(cancel));

        reporter.ingest_block(101, &single_fragment_block(101, 1));
        // Past a few failures, the submitter now sleeps for the 16s ceiling.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(matches!(
            handle.submission_state(CheckpointId(1)),
            Some(SubmissionState::Failed(_))
        ));

        let started = tokio::time::Instant::now();
        coordinator.shutdown().await.unwrap();
        assert!(started.elapsed() < grace);
    }

    #[tokio::test(start_paused = true)]
    async fn rescan_recovers_blocks_mined_before_start() {
        let rpc = MockBtcRpc::new(100);
        let (payload, scripts) = three_fragment_payload();
        let mut prev = rpc.tip_hash();
        for (height, script) in (101..).zip(scripts) {
            let block = generate_block(height, prev, vec![generate_tx_with_output(script)]);
            prev = block.block_hash();
            rpc.mine(block);
        }

        let btc = BtcClient::connect(rpc.clone(), btc_config(), BtcClientMetrics::default())
            .await
            .unwrap();
        let sidechain = MockSideChain::new();
        let reporter = Reporter::new(config(), sidechain.clone(), ReporterMetrics::default());
        let handle = reporter.handle();

        assert!(matches!(
            handle.request_rescan(10, 5),
            Err(ReporterError::InvalidRange { .. })
        ));
        assert!(matches!(
            handle.request_rescan(0, 1_000_000),
            Err(ReporterError::RangeTooLarge { .. })
        ));

        let cancel = CancellationToken::new();
        let blocks = btc.subscribe_blocks().await;
        let ingest = tokio::spawn(reporter.clone().run_ingest(btc.clone(), blocks, cancel.clone()));
        let submitter = tokio::spawn(reporter.clone().run_submitter(cancel.clone()));
        btc.start();

        handle.request_rescan(101, 105).unwrap();
        wait_for_state(&handle, CheckpointId(1), SubmissionState::Acknowledged).await;
        assert_eq!(sidechain.submissions()[0].payload, payload);

        cancel.cancel();
        ingest.await.unwrap();
        submitter.await.unwrap();
        btc.stop();
        btc.wait_for_shutdown().await;
    }
}
