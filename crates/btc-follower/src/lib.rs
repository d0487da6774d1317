//! # `btc-follower`
//!
//! `btc-follower` keeps a resilient view of the best Bitcoin chain. It delivers every block of the
//! best chain, in height order, to its subscribers, survives node restarts with an exponential
//! backoff, and re-synchronizes across reorgs by walking back from the last delivered block.
//!
//! Besides the block feed, the [`client::BtcClient`] exposes the ad-hoc reads the watchers need
//! (unspent outputs, blocks by height, mempool lookups) and transaction broadcasting.

pub mod client;
pub mod config;
mod constants;
mod cursor;
pub mod event;
mod follower;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod rpc;
pub mod subscription;

pub use constants::{
    DEFAULT_POLL_INTERVAL, DEFAULT_REORG_SAFETY_DEPTH, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SPENDER_SEARCH_DEPTH, MIN_NODE_VERSION,
};
