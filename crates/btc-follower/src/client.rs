//! This module contains the top level [`BtcClient`] implementation.
//!
//! Once the client is connected, consumers of this API create [`Subscription`]s with
//! [`BtcClient::subscribe_blocks`] and call [`BtcClient::start`] to begin delivery. These
//! subscription objects can be primarily worked with via their [`futures::Stream`] trait API.
use std::{fmt, mem, sync::Arc};

use anchor_watch_common::metrics::BtcClientMetrics;
use anchor_watch_primitives::staking::SpendLocation;
use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, Txid};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{
    config::BtcClientConfig,
    constants::MIN_NODE_VERSION,
    cursor::ChainCursor,
    event::{BlockEvent, ConnectionStatus},
    follower,
    rpc::{Broadcaster, ClientError, ClientResult, Reader, UtxoInfo},
    subscription::Subscription,
};

/// State shared between the client handles and the follower task.
pub(crate) struct Shared<R> {
    pub(crate) rpc: R,
    pub(crate) cfg: BtcClientConfig,
    pub(crate) subscribers: Mutex<Vec<mpsc::UnboundedSender<BlockEvent>>>,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) metrics: BtcClientMetrics,
    pub(crate) cancel: CancellationToken,
}

impl<R> Shared<R> {
    /// Sends `event` to every live subscriber, dropping the ones that went away.
    pub(crate) async fn publish(&self, event: BlockEvent) {
        self.subscribers
            .lock()
            .await
            .retain(|sub| sub.send(event.clone()).is_ok());
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let degraded = !matches!(
            status,
            ConnectionStatus::Connected | ConnectionStatus::Stopped
        );
        self.metrics.connection_degraded.set(i64::from(degraded));

        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

enum Worker {
    Idle(ChainCursor),
    Running(JoinHandle<()>),
    Finished,
}

/// Resilient client of a `bitcoind` node.
///
/// The client is a cheap handle: clones share the same connection state, subscribers and
/// follower task.
pub struct BtcClient<R> {
    shared: Arc<Shared<R>>,
    worker: Arc<parking_lot::Mutex<Worker>>,
}

impl<R> Clone for BtcClient<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl<R> fmt::Debug for BtcClient<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtcClient")
            .field("rpc_url", &self.shared.cfg.rpc_url)
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl<R: Reader> BtcClient<R> {
    /// Primary constructor for [`BtcClient`].
    ///
    /// Performs the initial handshake with the node. Failing to reach the node here is fatal and
    /// returned to the caller; later failures are retried in the background.
    pub async fn connect(
        rpc: R,
        cfg: BtcClientConfig,
        metrics: BtcClientMetrics,
    ) -> ClientResult<Self> {
        trace!(?cfg, "connecting to bitcoind");
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        metrics.connection_degraded.set(1);

        let version = rpc.get_node_version().await.inspect_err(|e| {
            error!(%e, url = %cfg.rpc_url, "could not connect to bitcoin node");
        })?;
        if version < MIN_NODE_VERSION {
            error!(%version, url = %cfg.rpc_url, "bitcoin node is too old");
            return Err(ClientError::UnsupportedNode(version));
        }

        let tip = rpc.get_block_count().await.inspect_err(|e| {
            error!(%e, url = %cfg.rpc_url, "could not connect to bitcoin node");
        })?;

        let start_height = cfg.start_height.unwrap_or(tip + 1);
        let cursor = ChainCursor::new(start_height, cfg.reorg_safety_depth);
        info!(%tip, %start_height, url = %cfg.rpc_url, "connected to bitcoin node");

        let shared = Arc::new(Shared {
            rpc,
            cfg,
            subscribers: Mutex::new(Vec::new()),
            status,
            metrics,
            cancel: CancellationToken::new(),
        });
        shared.set_status(ConnectionStatus::Connected);

        Ok(Self {
            shared,
            worker: Arc::new(parking_lot::Mutex::new(Worker::Idle(cursor))),
        })
    }

    /// Starts delivering blocks to subscribers. Calling it again has no effect.
    pub fn start(&self) {
        let mut worker = self.worker.lock();

        match mem::replace(&mut *worker, Worker::Finished) {
            Worker::Idle(cursor) => {
                info!(next_height = cursor.next_height(), "starting block follower");
                let handle = task::spawn(follower::run(self.shared.clone(), cursor));
                *worker = Worker::Running(handle);
            }
            other => {
                debug!("block follower already started");
                *worker = other;
            }
        }
    }

    /// Creates a new [`Subscription`] that emits a [`BlockEvent`] for every block of the best
    /// chain delivered from now on.
    pub async fn subscribe_blocks(&self) -> Subscription<BlockEvent> {
        let (send, recv) = mpsc::unbounded_channel();

        trace!("subscribing to blocks");

        self.shared.subscribers.lock().await.push(send);

        Subscription::from_receiver(recv)
    }

    /// Returns the number of active block subscriptions.
    pub async fn num_block_subscriptions(&self) -> usize {
        self.shared.subscribers.lock().await.len()
    }

    /// Fetches the best-chain block at `height`.
    pub async fn get_block_at(&self, height: u64) -> ClientResult<BlockEvent> {
        let hash = self.shared.rpc.get_block_hash(height).await?;
        let block = self.shared.rpc.get_block(&hash).await?;

        Ok(BlockEvent { height, block })
    }

    /// Height of the best chain tip.
    pub async fn get_block_count(&self) -> ClientResult<u64> {
        self.shared.rpc.get_block_count().await
    }

    /// The output `vout` of `txid` if it is unspent.
    ///
    /// Returns `Ok(None)` when the output is spent (or, with `include_mempool`, spent by a mempool
    /// transaction), which is distinct from failing to ask.
    pub async fn get_tx_out(
        &self,
        txid: &Txid,
        vout: u32,
        include_mempool: bool,
    ) -> ClientResult<Option<UtxoInfo>> {
        self.shared.rpc.get_tx_out(txid, vout, include_mempool).await
    }

    /// Fetches a transaction by txid.
    pub async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction> {
        self.shared.rpc.get_raw_transaction(txid).await
    }

    /// Looks for the transaction spending `outpoint`, first in the mempool and then in the most
    /// recent blocks.
    pub async fn find_spender(
        &self,
        outpoint: OutPoint,
    ) -> ClientResult<Option<(Transaction, SpendLocation)>> {
        let rpc = &self.shared.rpc;

        for txid in rpc.get_raw_mempool().await? {
            let tx = match rpc.get_raw_transaction(&txid).await {
                Ok(tx) => tx,
                // evicted or mined since the mempool listing
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            if spends(&tx, &outpoint) {
                return Ok(Some((tx, SpendLocation::Mempool)));
            }
        }

        let tip = rpc.get_block_count().await?;
        let depth = self.shared.cfg.spender_search_depth as u64;
        let lowest = tip.saturating_sub(depth.saturating_sub(1));

        for height in (lowest..=tip).rev() {
            let event = match self.get_block_at(height).await {
                Ok(event) => event,
                // the node has nothing below this height
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            };

            if let Some(tx) = event.block.txdata.iter().find(|tx| spends(tx, &outpoint)) {
                let location = SpendLocation::Block(event.block_ref());
                return Ok(Some((tx.clone(), location)));
            }
        }

        Ok(None)
    }
}

impl<R> BtcClient<R> {
    /// The current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// A receiver notified on every connection status change.
    pub fn watch_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &BtcClientConfig {
        &self.shared.cfg
    }

    /// Direct access to the underlying RPC client.
    pub fn rpc(&self) -> &R {
        &self.shared.rpc
    }

    /// Requests the follower task to stop. Calling it again has no effect.
    pub fn stop(&self) {
        if !self.shared.cancel.is_cancelled() {
            info!("stopping block follower");
            self.shared.cancel.cancel();
        }
    }

    /// Waits for the follower task to exit after [`Self::stop`], then closes every subscription.
    ///
    /// Safe to call any number of times, from any clone.
    pub async fn wait_for_shutdown(&self) {
        let worker = mem::replace(&mut *self.worker.lock(), Worker::Finished);

        if let Worker::Running(handle) = worker {
            if let Err(e) = handle.await {
                error!(%e, "block follower task failed");
            }
        }

        self.shared.subscribers.lock().await.clear();
        self.shared.set_status(ConnectionStatus::Stopped);
    }
}

#[async_trait]
impl<R: Broadcaster> Broadcaster for BtcClient<R> {
    async fn send_raw_transaction(&self, tx: &Transaction) -> ClientResult<Txid> {
        self.shared.rpc.send_raw_transaction(tx).await
    }
}

fn spends(tx: &Transaction, outpoint: &OutPoint) -> bool {
    tx.input.iter().any(|input| input.previous_output == *outpoint)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anchor_watch_common::retry::RetryPolicy;
    use anchor_watch_test_utils::bitcoin::{generate_block, generate_chain, generate_spending_tx};
    use bitcoin::{hashes::Hash, Sequence};
    use futures::StreamExt;

    use super::*;
    use crate::mock::MockBtcRpc;

    const POLL: Duration = Duration::from_secs(1);

    fn config() -> BtcClientConfig {
        BtcClientConfig::new("http://127.0.0.1:18443", "user", "password")
            .with_poll_interval(POLL)
            .with_retry_policy(RetryPolicy::new(
                Duration::from_secs(2),
                Duration::from_secs(8),
            ))
            .with_reorg_safety_depth(6)
    }

    async fn next_block(sub: &mut Subscription<BlockEvent>) -> BlockEvent {
        tokio::time::timeout(Duration::from_secs(60), sub.next())
            .await
            .expect("block must arrive")
            .expect("subscription must be open")
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connection_failure_is_fatal() {
        let rpc = MockBtcRpc::new(100);
        rpc.set_offline(true);

        let result = BtcClient::connect(rpc, config(), BtcClientMetrics::default()).await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn old_nodes_are_refused() {
        let rpc = MockBtcRpc::new(100);
        rpc.set_node_version(270_100);

        let result = BtcClient::connect(rpc.clone(), config(), BtcClientMetrics::default()).await;
        assert!(matches!(result, Err(ClientError::UnsupportedNode(270_100))));

        rpc.set_node_version(MIN_NODE_VERSION);
        let result = BtcClient::connect(rpc, config(), BtcClientMetrics::default()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_new_blocks_in_height_order() {
        let rpc = MockBtcRpc::new(100);
        let client = BtcClient::connect(rpc.clone(), config(), BtcClientMetrics::default())
            .await
            .unwrap();
        let mut sub = client.subscribe_blocks().await;
        client.start();
        client.start();

        let blocks = generate_chain(101, 3, rpc.tip_hash());
        for block in &blocks {
            rpc.mine(block.clone());
        }

        for (expected_height, expected) in (101..).zip(&blocks) {
            let event = next_block(&mut sub).await;
            assert_eq!(event.height, expected_height);
            assert_eq!(event.block.block_hash(), expected.block_hash());
        }

        client.stop();
        client.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_height_replays_history() {
        let rpc = MockBtcRpc::new(100);
        for block in generate_chain(101, 4, rpc.tip_hash()) {
            rpc.mine(block);
        }

        let client = BtcClient::connect(
            rpc.clone(),
            config().with_start_height(102),
            BtcClientMetrics::default(),
        )
        .await
        .unwrap();
        let mut sub = client.subscribe_blocks().await;
        client.start();

        for height in 102..=104 {
            assert_eq!(next_block(&mut sub).await.height, height);
        }

        client.stop();
        client.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reorg_redelivers_from_the_fork_point() {
        let rpc = MockBtcRpc::new(100);
        let client = BtcClient::connect(rpc.clone(), config(), BtcClientMetrics::default())
            .await
            .unwrap();
        let mut sub = client.subscribe_blocks().await;
        client.start();

        let fork_base = rpc.tip_hash();
        let original = generate_chain(101, 3, fork_base);
        for block in &original {
            rpc.mine(block.clone());
        }
        for _ in 0..3 {
            next_block(&mut sub).await;
        }

        // replace 102 and 103, extend to 104
        let competing = generate_chain(102, 3, original[0].block_hash());
        rpc.reorg(102, competing.clone());

        for expected in &competing {
            let event = next_block(&mut sub).await;
            assert_eq!(event.block.block_hash(), expected.block_hash());
        }

        client.stop();
        client.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_and_resumes() {
        let rpc = MockBtcRpc::new(100);
        let metrics = BtcClientMetrics::default();
        let client = BtcClient::connect(rpc.clone(), config(), metrics.clone())
            .await
            .unwrap();
        let mut status = client.watch_connection_status();
        let mut sub = client.subscribe_blocks().await;
        client.start();

        rpc.set_offline(true);
        status
            .wait_for(|s| matches!(s, ConnectionStatus::Reconnecting { attempts: 2, .. }))
            .await
            .unwrap();
        assert_eq!(
            client.connection_status(),
            ConnectionStatus::Reconnecting {
                attempts: 2,
                retry_in: Duration::from_secs(4),
            }
        );
        assert_eq!(metrics.connection_degraded.get(), 1);

        let block = generate_block(101, rpc.tip_hash(), vec![]);
        rpc.mine(block.clone());
        rpc.set_offline(false);

        let event = next_block(&mut sub).await;
        assert_eq!(event.block.block_hash(), block.block_hash());
        status.wait_for(ConnectionStatus::is_connected).await.unwrap();
        assert_eq!(metrics.connection_degraded.get(), 0);
        assert!(metrics.reconnect_attempts.get() >= 2);

        client.stop();
        client.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_closes_subscriptions() {
        let rpc = MockBtcRpc::new(100);
        let client = BtcClient::connect(rpc, config(), BtcClientMetrics::default())
            .await
            .unwrap();
        let mut sub = client.subscribe_blocks().await;
        client.start();

        client.stop();
        client.stop();
        client.wait_for_shutdown().await;
        client.clone().wait_for_shutdown().await;

        assert_eq!(client.connection_status(), ConnectionStatus::Stopped);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn finds_spender_in_mempool_and_blocks() {
        let rpc = MockBtcRpc::new(100);
        let client = BtcClient::connect(rpc.clone(), config(), BtcClientMetrics::default())
            .await
            .unwrap();

        let mempool_spent = OutPoint::new(Txid::all_zeros(), 0);
        let mempool_spender = generate_spending_tx(mempool_spent, Sequence::MAX);
        rpc.add_mempool_tx(mempool_spender.clone());

        let mined_spent = OutPoint::new(Txid::all_zeros(), 1);
        let mined_spender = generate_spending_tx(mined_spent, Sequence::MAX);
        let block = generate_block(101, rpc.tip_hash(), vec![mined_spender.clone()]);
        rpc.mine(block.clone());

        let (tx, location) = client.find_spender(mempool_spent).await.unwrap().unwrap();
        assert_eq!(tx, mempool_spender);
        assert_eq!(location, SpendLocation::Mempool);

        let (tx, location) = client.find_spender(mined_spent).await.unwrap().unwrap();
        assert_eq!(tx, mined_spender);
        assert!(matches!(location, SpendLocation::Block(b) if b.height == 101
            && b.hash == block.block_hash()));

        let unspent = OutPoint::new(Txid::all_zeros(), 2);
        assert!(client.find_spender(unspent).await.unwrap().is_none());
    }
}
