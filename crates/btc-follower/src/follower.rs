//! The task feeding the block subscriptions.
//!
//! A session synchronizes the subscribers with the node's best chain and then waits for a ZMQ
//! `hashblock` notification or the next poll tick before synchronizing again. Any RPC failure
//! ends the session; the task then sleeps for the current backoff interval and starts a new one,
//! resuming from the last delivered block.

use std::sync::Arc;

use anchor_watch_common::retry::{sleep_or_cancel, Backoff};
use bitcoin::BlockHash;
use bitcoincore_zmq::Message;
use futures::{stream::BoxStream, StreamExt};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::{
    client::Shared,
    cursor::ChainCursor,
    event::{BlockEvent, ConnectionStatus},
    rpc::{ClientResult, Reader},
};

type Wakeups = BoxStream<'static, Result<Message, bitcoincore_zmq::Error>>;

/// Runs sessions until the client is cancelled.
pub(crate) async fn run<R: Reader>(shared: Arc<Shared<R>>, mut cursor: ChainCursor) {
    let mut backoff = shared.cfg.retry.backoff();

    loop {
        match session(&shared, &mut cursor, &mut backoff).await {
            Ok(()) => break,
            Err(err) => {
                let delay = backoff.record_failure();
                shared.metrics.reconnect_attempts.inc();
                shared.set_status(ConnectionStatus::Reconnecting {
                    attempts: backoff.failures(),
                    retry_in: delay,
                });
                warn!(%err, ?delay, attempts = backoff.failures(), "lost connection to bitcoin node");

                if !sleep_or_cancel(delay, &shared.cancel).await {
                    break;
                }
                info!(next_height = cursor.next_height(), "reconnecting to bitcoin node");
            }
        }
    }

    debug!("block follower exiting");
}

/// One connected session. Returns `Ok(())` only when cancelled.
async fn session<R: Reader>(
    shared: &Shared<R>,
    cursor: &mut ChainCursor,
    backoff: &mut Backoff,
) -> ClientResult<()> {
    let mut wakeups = open_wakeups(shared.cfg.hashblock_connection_string.as_deref());

    let mut ticker = time::interval(shared.cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => trace!("polling chain tip"),
            msg = next_wakeup(&mut wakeups) => match msg {
                Some(Ok(msg)) => trace!(topic = %msg.topic_str(), "received block notification"),
                Some(Err(e)) => warn!(%e, "error reading block notifications"),
                None => {
                    warn!("block notification stream closed, falling back to polling");
                    wakeups = None;
                }
            },
        }

        sync_to_tip(shared, cursor).await?;

        if !shared.status.borrow().is_connected() {
            info!(next_height = cursor.next_height(), "connected to bitcoin node");
        }
        backoff.record_success();
        shared.set_status(ConnectionStatus::Connected);
    }
}

fn open_wakeups(endpoint: Option<&str>) -> Option<Wakeups> {
    let endpoint = endpoint?;

    match bitcoincore_zmq::subscribe_async(&[endpoint]) {
        Ok(stream) => {
            debug!(%endpoint, "subscribed to block notifications");
            Some(stream.boxed())
        }
        Err(e) => {
            warn!(%e, %endpoint, "could not subscribe to block notifications, polling only");
            None
        }
    }
}

async fn next_wakeup(
    wakeups: &mut Option<Wakeups>,
) -> Option<Result<Message, bitcoincore_zmq::Error>> {
    match wakeups {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Delivers every block between the cursor and the node's tip.
pub(crate) async fn sync_to_tip<R: Reader>(
    shared: &Shared<R>,
    cursor: &mut ChainCursor,
) -> ClientResult<()> {
    let tip = shared.rpc.get_block_count().await?;
    let mut height = resolve_next_height(&shared.rpc, cursor, tip).await?;

    while height <= tip {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }

        let hash = shared.rpc.get_block_hash(height).await?;
        let block = shared.rpc.get_block(&hash).await?;

        let parent = height.checked_sub(1).and_then(|h| cursor.hash_at(h));
        if parent.is_some_and(|parent| parent != block.header.prev_blockhash) {
            warn!(%height, %hash, "chain changed during sync, looking for the fork point");
            height = resolve_next_height(&shared.rpc, cursor, tip).await?;
            continue;
        }

        debug!(%height, %hash, "delivering block");
        cursor.record(height, hash);
        shared.publish(BlockEvent { height, block }).await;
        height += 1;
    }

    Ok(())
}

/// Walks back from the last delivered block until it is found on the node's best chain.
///
/// Returns the height right after it. When the whole window turns out to be stale, delivery
/// resumes at the oldest remembered height.
async fn resolve_next_height<R: Reader>(
    rpc: &R,
    cursor: &mut ChainCursor,
    tip: u64,
) -> ClientResult<u64> {
    while let Some((height, hash)) = cursor.last() {
        if height <= tip && block_hash_at(rpc, height).await? == Some(hash) {
            return Ok(height + 1);
        }

        warn!(%height, %hash, "delivered block left the best chain");
        cursor.pop();
    }

    Ok(cursor.next_height())
}

async fn block_hash_at<R: Reader>(rpc: &R, height: u64) -> ClientResult<Option<BlockHash>> {
    match rpc.get_block_hash(height).await {
        Ok(hash) => Ok(Some(hash)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
