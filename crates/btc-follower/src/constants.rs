//! This module provides the constant values used throughout the crate.

use std::time::Duration;

/// Default number of blocks after which a block is no longer expected to be reorganized away.
///
/// The follower remembers this many delivered blocks to find the fork point after a reorg.
pub const DEFAULT_REORG_SAFETY_DEPTH: usize = 6;

/// Default interval between two polls of the chain tip.
///
/// Polling is the fallback when no ZMQ endpoint is configured or a notification was missed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout of a single RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of recent blocks searched for the transaction spending an output.
pub const DEFAULT_SPENDER_SEARCH_DEPTH: usize = 6;

/// Oldest supported Bitcoin Core release, as reported by `getnetworkinfo`.
///
/// Earlier releases answer JSON-RPC 2.0 errors with HTTP 404 or 500, which the HTTP client
/// reports without the error object, so broadcast rejections and missing transactions could not
/// be told apart from an outage.
pub const MIN_NODE_VERSION: u32 = 280_000;

/// Bitcoin Core's `RPC_INVALID_ADDRESS_OR_KEY`, returned for unknown transactions and blocks.
pub(crate) const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Bitcoin Core's `RPC_INVALID_PARAMETER`, returned for heights above the tip.
pub(crate) const RPC_INVALID_PARAMETER: i32 = -8;

/// Bitcoin Core's `RPC_DESERIALIZATION_ERROR`.
pub(crate) const RPC_DESERIALIZATION_ERROR: i32 = -22;

/// Bitcoin Core's `RPC_VERIFY_ERROR`.
pub(crate) const RPC_VERIFY_ERROR: i32 = -25;

/// Bitcoin Core's `RPC_VERIFY_REJECTED`.
pub(crate) const RPC_VERIFY_REJECTED: i32 = -26;

/// Bitcoin Core's `RPC_VERIFY_ALREADY_IN_CHAIN`.
pub(crate) const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

/// Bitcoin Core's `RPC_IN_WARMUP`.
pub(crate) const RPC_IN_WARMUP: i32 = -28;
