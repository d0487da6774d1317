//! This module implements a system that accepts signed transactions and makes sure each of them
//! reaches the base-chain mempool exactly once.
//!
//! Relaying is serialized per txid: concurrent requests for a transaction already being
//! broadcast wait for that broadcast and share its result. A transaction that was broadcast
//! successfully or rejected as invalid is never sent again.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use anchor_watch_common::{
    metrics::RelayerMetrics,
    retry::{retry_with, RetryAction, RetryError, RetryPolicy},
};
use anchor_watch_sidechain::SideChain;
use bitcoin::{Transaction, Txid};
use btc_follower::rpc::{Broadcaster, ClientError, Rejection};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for the [`Relayer`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The node refused the transaction as invalid, e.g. because one of its inputs is spent.
    #[error("transaction rejected by the node: {0}")]
    Rejected(ClientError),

    /// The relayer was stopped before the transaction went through.
    #[error("relay cancelled")]
    Cancelled,
}

/// How a relay request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The transaction was accepted into the mempool.
    Broadcast,

    /// The node already had the transaction.
    AlreadyKnown,

    /// This relayer had already broadcast the transaction.
    Duplicate,
}

type RelayResult = Result<RelayOutcome, RelayError>;

enum Job {
    InFlight(watch::Receiver<Option<RelayResult>>),
    Done,
    Rejected(ClientError),
}

enum Role {
    Leader(watch::Sender<Option<RelayResult>>),
    Follower(watch::Receiver<Option<RelayResult>>),
}

struct Inner<B> {
    broadcaster: B,
    retry: RetryPolicy,
    metrics: RelayerMetrics,
    jobs: Mutex<HashMap<Txid, Job>>,
}

/// Broadcasts signed transactions with fee and availability retries.
pub struct Relayer<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Relayer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B> fmt::Debug for Relayer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relayer")
            .field("retry", &self.inner.retry)
            .field("jobs", &self.inner.jobs.lock().len())
            .finish_non_exhaustive()
    }
}

impl<B: Broadcaster> Relayer<B> {
    /// Creates a relayer broadcasting through `broadcaster`.
    pub fn new(broadcaster: B, retry: RetryPolicy, metrics: RelayerMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                broadcaster,
                retry,
                metrics,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether `txid` was broadcast, rejected, or is being broadcast.
    pub fn is_known(&self, txid: &Txid) -> bool {
        self.inner.jobs.lock().contains_key(txid)
    }

    /// Forgets finished transactions not in `pending`. Broadcasts in flight are kept.
    fn prune(&self, pending: &HashSet<Txid>) {
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|txid, job| matches!(job, Job::InFlight(_)) || pending.contains(txid));

        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!(%pruned, "forgot settled transactions");
        }
    }

    /// Broadcasts `tx`, retrying while the fee is too low or the node is unavailable.
    pub async fn relay(&self, tx: &Transaction, cancel: &CancellationToken) -> RelayResult {
        let txid = tx.compute_txid();

        let role = {
            let mut jobs = self.inner.jobs.lock();
            let in_flight = match jobs.get(&txid) {
                Some(Job::Done) => {
                    debug!(%txid, "transaction already broadcast");
                    return Ok(RelayOutcome::Duplicate);
                }
                Some(Job::Rejected(err)) => {
                    debug!(%txid, "transaction already rejected");
                    return Err(RelayError::Rejected(err.clone()));
                }
                Some(Job::InFlight(rx)) if rx.has_changed().is_ok() => Some(rx.clone()),
                // Nothing recorded, or the previous attempt was dropped midway.
                _ => None,
            };

            match in_flight {
                Some(rx) => Role::Follower(rx),
                None => {
                    let (sender, rx) = watch::channel(None);
                    jobs.insert(txid, Job::InFlight(rx));
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(%txid, "waiting for broadcast in progress");
                let result = rx.wait_for(Option::is_some).await;
                match result {
                    Ok(result) => result.clone().unwrap_or(Err(RelayError::Cancelled)),
                    Err(_) => Err(RelayError::Cancelled),
                }
            }
            Role::Leader(sender) => {
                let result = self.broadcast(tx, txid, cancel).await;

                {
                    let mut jobs = self.inner.jobs.lock();
                    match &result {
                        Ok(_) => {
                            jobs.insert(txid, Job::Done);
                        }
                        // resending the same bytes cannot succeed
                        Err(RelayError::Rejected(err)) => {
                            jobs.insert(txid, Job::Rejected(err.clone()));
                        }
                        Err(RelayError::Cancelled) => {
                            jobs.remove(&txid);
                        }
                    }
                }
                sender.send_replace(Some(result.clone()));

                result
            }
        }
    }

    async fn broadcast(
        &self,
        tx: &Transaction,
        txid: Txid,
        cancel: &CancellationToken,
    ) -> RelayResult {
        let result = retry_with(
            self.inner.retry,
            cancel,
            |err: &ClientError, _| match err.rejection() {
                Rejection::FeeTooLow | Rejection::Unavailable => RetryAction::Retry,
                Rejection::Invalid | Rejection::AlreadyKnown => RetryAction::Stop,
            },
            || async move {
                match self.inner.broadcaster.send_raw_transaction(tx).await {
                    Ok(_) => Ok(RelayOutcome::Broadcast),
                    Err(err) if err.rejection() == Rejection::AlreadyKnown => {
                        Ok(RelayOutcome::AlreadyKnown)
                    }
                    Err(err) => {
                        self.inner.metrics.broadcast_failures.inc();
                        warn!(%txid, %err, rejection = ?err.rejection(), "broadcast failed");
                        Err(err)
                    }
                }
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                self.inner.metrics.broadcasts.inc();
                info!(%txid, ?outcome, "broadcast transaction");
                Ok(outcome)
            }
            Err(RetryError::Stopped(err)) => {
                error!(%txid, %err, "transaction rejected, giving up");
                Err(RelayError::Rejected(err))
            }
            Err(RetryError::Cancelled) => Err(RelayError::Cancelled),
        }
    }

    /// Polls `sidechain` for transactions waiting to be anchored and relays each new one in its
    /// own task until cancelled.
    ///
    /// Transactions the side-chain no longer lists are forgotten.
    pub async fn run_anchors<S: SideChain>(
        self,
        sidechain: S,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut relays = JoinSet::new();
        info!("relayer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = relays.join_next() => {
                    if let Err(e) = joined {
                        error!(%e, "relay task failed");
                    }
                }
                _ = ticker.tick() => {
                    let anchors = match sidechain.pending_anchors().await {
                        Ok(anchors) => anchors,
                        Err(err) => {
                            warn!(%err, "could not fetch pending anchors");
                            continue;
                        }
                    };

                    let txs = anchors
                        .into_iter()
                        .filter_map(|anchor| match anchor.decode() {
                            Ok(tx) => Some(tx),
                            Err(e) => {
                                warn!(id = anchor.id, %e, "skipping undecodable anchor transaction");
                                None
                            }
                        })
                        .collect::<Vec<_>>();
                    self.prune(&txs.iter().map(Transaction::compute_txid).collect());

                    for tx in txs {
                        if self.is_known(&tx.compute_txid()) {
                            continue;
                        }

                        let relayer = self.clone();
                        let cancel = cancel.clone();
                        relays.spawn(async move {
                            // Errors are logged by the relayer itself.
                            let _ = relayer.relay(&tx, &cancel).await;
                        });
                    }
                }
            }
        }

        while relays.join_next().await.is_some() {}
        info!("relayer exiting");
    }
}

#[cfg(test)]
mod tests {
    use anchor_watch_sidechain::{mock::MockSideChain, types::RpcAnchorTx};
    use anchor_watch_test_utils::bitcoin::generate_tx;
    use bitcoin::consensus;
    use btc_follower::mock::MockBtcRpc;

    use super::*;

    fn relayer(rpc: &MockBtcRpc) -> Relayer<MockBtcRpc> {
        Relayer::new(
            rpc.clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8)),
            RelayerMetrics::default(),
        )
    }

    fn server(code: i32, message: &str) -> ClientError {
        ClientError::Server {
            code,
            message: message.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_once() {
        let rpc = MockBtcRpc::new(100);
        let relayer = relayer(&rpc);
        let cancel = CancellationToken::new();
        let tx = generate_tx(1, 1);

        assert_eq!(relayer.relay(&tx, &cancel).await, Ok(RelayOutcome::Broadcast));
        assert_eq!(relayer.relay(&tx, &cancel).await, Ok(RelayOutcome::Duplicate));
        assert_eq!(rpc.broadcasts(), vec![tx]);
    }

    #[tokio::test(start_paused = true)]
    async fn low_fee_is_retried_with_backoff() {
        let rpc = MockBtcRpc::new(100);
        rpc.fail_next_broadcasts([
            server(-26, "min relay fee not met"),
            server(-26, "mempool min fee not met"),
        ]);
        let relayer = relayer(&rpc);
        let tx = generate_tx(1, 1);

        let started = time::Instant::now();
        let result = relayer.relay(&tx, &CancellationToken::new()).await;

        assert_eq!(result, Ok(RelayOutcome::Broadcast));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(rpc.broadcasts().len(), 1);
        assert_eq!(relayer.inner.metrics.broadcast_failures.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_transactions_are_terminal() {
        let rpc = MockBtcRpc::new(100);
        rpc.fail_next_broadcasts([server(-25, "bad-txns-inputs-missingorspent")]);
        let relayer = relayer(&rpc);
        let tx = generate_tx(1, 1);

        let result = relayer.relay(&tx, &CancellationToken::new()).await;

        assert!(matches!(result, Err(RelayError::Rejected(_))));
        assert!(rpc.broadcasts().is_empty());
        assert!(relayer.is_known(&tx.compute_txid()));

        // a later request gets the same answer without another attempt
        let again = relayer.relay(&tx, &CancellationToken::new()).await;
        assert_eq!(again, result);
        assert_eq!(rpc.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_known_counts_as_success() {
        let rpc = MockBtcRpc::new(100);
        rpc.fail_next_broadcasts([server(-27, "Transaction already in block chain")]);
        let relayer = relayer(&rpc);
        let tx = generate_tx(1, 1);

        let result = relayer.relay(&tx, &CancellationToken::new()).await;

        assert_eq!(result, Ok(RelayOutcome::AlreadyKnown));
        assert!(relayer.is_known(&tx.compute_txid()));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_broadcast() {
        let rpc = MockBtcRpc::new(100);
        rpc.fail_next_broadcasts([server(-26, "min relay fee not met")]);
        let relayer = relayer(&rpc);
        let cancel = CancellationToken::new();
        let tx = generate_tx(2, 1);

        let (first, second) =
            tokio::join!(relayer.relay(&tx, &cancel), relayer.relay(&tx, &cancel));

        assert_eq!(first, Ok(RelayOutcome::Broadcast));
        assert_eq!(second, Ok(RelayOutcome::Broadcast));
        assert_eq!(rpc.broadcasts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let rpc = MockBtcRpc::new(100);
        rpc.set_offline(true);
        let relayer = relayer(&rpc);
        let cancel = CancellationToken::new();
        let tx = generate_tx(1, 1);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(20)).await;
            canceller.cancel();
        });

        assert_eq!(relayer.relay(&tx, &cancel).await, Err(RelayError::Cancelled));
        assert!(!relayer.is_known(&tx.compute_txid()));
    }

    #[tokio::test(start_paused = true)]
    async fn relays_pending_anchors() {
        let rpc = MockBtcRpc::new(100);
        let relayer = relayer(&rpc);
        let sidechain = MockSideChain::new();
        let tx = generate_tx(1, 2);
        sidechain.set_anchors(vec![
            RpcAnchorTx {
                id: 1,
                tx: vec![0xff, 0x00],
            },
            RpcAnchorTx {
                id: 2,
                tx: consensus::serialize(&tx),
            },
        ]);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(relayer.clone().run_anchors(
            sidechain.clone(),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        // Several polls see the same anchor.
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rpc.broadcasts(), vec![tx]);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_anchor_is_attempted_once() {
        let rpc = MockBtcRpc::new(100);
        rpc.fail_next_broadcasts([server(-25, "bad-txns-inputs-missingorspent")]);
        let relayer = relayer(&rpc);
        let sidechain = MockSideChain::new();
        sidechain.set_anchors(vec![RpcAnchorTx {
            id: 1,
            tx: consensus::serialize(&generate_tx(1, 1)),
        }]);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(relayer.clone().run_anchors(
            sidechain,
            Duration::from_secs(5),
            cancel.clone(),
        ));

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rpc.calls(), 1);
        assert!(rpc.broadcasts().is_empty());

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn settled_anchors_are_forgotten() {
        let rpc = MockBtcRpc::new(100);
        let relayer = relayer(&rpc);
        let sidechain = MockSideChain::new();
        let tx = generate_tx(1, 1);
        sidechain.set_anchors(vec![RpcAnchorTx {
            id: 1,
            tx: consensus::serialize(&tx),
        }]);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(relayer.clone().run_anchors(
            sidechain.clone(),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        time::sleep(Duration::from_secs(7)).await;
        assert!(relayer.is_known(&tx.compute_txid()));

        sidechain.set_anchors(vec![]);
        time::sleep(Duration::from_secs(10)).await;
        assert!(!relayer.is_known(&tx.compute_txid()));
        assert_eq!(rpc.broadcasts(), vec![tx]);

        cancel.cancel();
        worker.await.unwrap();
    }
}
