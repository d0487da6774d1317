//! Configuration of the [`crate::client::BtcClient`].
use std::time::Duration;

use anchor_watch_common::retry::RetryPolicy;

use crate::constants::{
    DEFAULT_POLL_INTERVAL, DEFAULT_REORG_SAFETY_DEPTH, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SPENDER_SEARCH_DEPTH,
};

/// BtcClientConfig holds everything the client needs to follow the chain of a `bitcoind` node.
///
/// The RPC endpoint is mandatory. The ZMQ `hashblock` endpoint is optional: when it is set, new
/// blocks are picked up as soon as the node announces them, otherwise the tip is polled every
/// `poll_interval`. The poll runs in both cases so that a dropped notification is never fatal.
///
/// The node must run Bitcoin Core 28.0 or later
/// ([`MIN_NODE_VERSION`](crate::MIN_NODE_VERSION)); the client refuses to connect to
/// older releases because their RPC errors cannot be classified.
///
/// You should construct a BtcClientConfig with [`BtcClientConfig::new`] and modify it with the
/// member methods on this struct.
#[derive(Debug, Clone)]
pub struct BtcClientConfig {
    /// URL of the JSON-RPC endpoint.
    pub(crate) rpc_url: String,

    /// RPC username.
    pub(crate) rpc_user: String,

    /// RPC password.
    pub(crate) rpc_password: String,

    /// Connection string used in `bitcoin.conf => zmqpubhashblock`.
    pub(crate) hashblock_connection_string: Option<String>,

    /// Backoff applied between reconnect attempts.
    pub(crate) retry: RetryPolicy,

    /// Number of delivered blocks remembered to find the fork point of a reorg.
    pub(crate) reorg_safety_depth: usize,

    /// Interval between two polls of the chain tip.
    pub(crate) poll_interval: Duration,

    /// Timeout of a single RPC request.
    pub(crate) request_timeout: Duration,

    /// Number of recent blocks searched when looking for the spender of an output.
    pub(crate) spender_search_depth: usize,

    /// First height to deliver. Delivery starts after the current tip when unset.
    pub(crate) start_height: Option<u64>,
}

impl BtcClientConfig {
    /// Creates a config for the node at `rpc_url` with default settings.
    pub fn new(
        rpc_url: impl Into<String>,
        rpc_user: impl Into<String>,
        rpc_password: impl Into<String>,
    ) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            rpc_user: rpc_user.into(),
            rpc_password: rpc_password.into(),
            hashblock_connection_string: None,
            retry: RetryPolicy::default(),
            reorg_safety_depth: DEFAULT_REORG_SAFETY_DEPTH,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            spender_search_depth: DEFAULT_SPENDER_SEARCH_DEPTH,
            start_height: None,
        }
    }

    /// Updates the config with a `zmqpubhashblock` connection string and returns it.
    ///
    /// Useful for a builder pattern with dotchaining.
    pub fn with_hashblock_connection_string(mut self, s: &str) -> Self {
        self.hashblock_connection_string = Some(s.to_string());
        self
    }

    /// Updates the reconnect backoff and returns the updated config.
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Updates the reorg-safety depth and returns the updated config.
    ///
    /// Note, this is the number of delivered blocks the follower remembers. A reorg deeper than
    /// this is not detected; the follower resumes from the oldest block it still remembers.
    pub const fn with_reorg_safety_depth(mut self, n: usize) -> Self {
        self.reorg_safety_depth = n;
        self
    }

    /// Updates the tip poll interval and returns the updated config.
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Updates the RPC request timeout and returns the updated config.
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Updates the spender search depth and returns the updated config.
    pub const fn with_spender_search_depth(mut self, n: usize) -> Self {
        self.spender_search_depth = n;
        self
    }

    /// Makes delivery start at `height` instead of after the current tip.
    pub const fn with_start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    /// URL of the JSON-RPC endpoint.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Credentials of the JSON-RPC endpoint.
    pub fn rpc_auth(&self) -> (&str, &str) {
        (&self.rpc_user, &self.rpc_password)
    }

    /// Timeout of a single RPC request.
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of recent blocks searched when looking for the spender of an output.
    pub const fn spender_search_depth(&self) -> usize {
        self.spender_search_depth
    }
}
