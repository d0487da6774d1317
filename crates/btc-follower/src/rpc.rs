//! The subset of the `bitcoind` JSON-RPC interface used by the watchers.
//!
//! Reads and broadcasting are split into two traits so that components only get the capability
//! they need and can be tested against [`crate::mock::MockBtcRpc`].

use std::{fmt, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bitcoin::{
    consensus::encode::{deserialize_hex, serialize_hex},
    Amount, Block, BlockHash, ScriptBuf, Transaction, Txid,
};
use jsonrpsee::{
    core::{client::ClientT, ClientError as RpcClientError},
    http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::constants::{
    MIN_NODE_VERSION, RPC_DESERIALIZATION_ERROR, RPC_INVALID_ADDRESS_OR_KEY,
    RPC_INVALID_PARAMETER, RPC_IN_WARMUP, RPC_VERIFY_ALREADY_IN_CHAIN, RPC_VERIFY_ERROR,
    RPC_VERIFY_REJECTED,
};

/// Result type of every node call.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by node calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The node could not be reached or did not answer in time.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with an error object.
    #[error("node returned error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i32,

        /// Human readable error message.
        message: String,
    },

    /// The node answered with something that could not be decoded.
    #[error("could not decode response: {0}")]
    Decode(String),

    /// The node is older than [`MIN_NODE_VERSION`].
    #[error("node version {0} is older than the oldest supported version {MIN_NODE_VERSION}")]
    UnsupportedNode(u32),
}

/// How a broadcast failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The fee does not satisfy the node's relay policy; retrying later may succeed.
    FeeTooLow,

    /// The node is unreachable or busy.
    Unavailable,

    /// The transaction is already in the mempool or the chain.
    AlreadyKnown,

    /// The transaction is invalid, e.g. one of its inputs is already spent.
    Invalid,
}

impl ClientError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Server { code, .. } => *code == RPC_IN_WARMUP,
            Self::Decode(_) | Self::UnsupportedNode(_) => false,
        }
    }

    /// Whether the node reported that the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Server { code, .. }
                if *code == RPC_INVALID_ADDRESS_OR_KEY || *code == RPC_INVALID_PARAMETER
        )
    }

    /// Classifies the error of a `sendrawtransaction` call.
    pub fn rejection(&self) -> Rejection {
        match self {
            Self::Transport(_) => Rejection::Unavailable,
            Self::Server { code, message } => match *code {
                RPC_VERIFY_ALREADY_IN_CHAIN => Rejection::AlreadyKnown,
                RPC_VERIFY_REJECTED if is_fee_message(message) => Rejection::FeeTooLow,
                RPC_VERIFY_REJECTED if message.contains("already-in-mempool") => {
                    Rejection::AlreadyKnown
                }
                RPC_VERIFY_REJECTED | RPC_VERIFY_ERROR | RPC_DESERIALIZATION_ERROR => {
                    Rejection::Invalid
                }
                _ => Rejection::Unavailable,
            },
            Self::Decode(_) => Rejection::Invalid,
            Self::UnsupportedNode(_) => Rejection::Unavailable,
        }
    }
}

fn is_fee_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("fee not met")
        || message.contains("insufficient fee")
        || message.contains("min relay fee")
}

impl From<RpcClientError> for ClientError {
    fn from(err: RpcClientError) -> Self {
        match err {
            RpcClientError::Call(obj) => Self::Server {
                code: obj.code(),
                message: obj.message().to_owned(),
            },
            RpcClientError::ParseError(e) => Self::Decode(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// An unspent transaction output as reported by `gettxout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInfo {
    /// Tip of the chain the answer refers to.
    #[serde(rename = "bestblock")]
    pub best_block: BlockHash,

    /// Number of confirmations of the output, zero when it only exists in the mempool.
    pub confirmations: u32,

    /// Value of the output.
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub value: Amount,

    /// Locking script of the output.
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: ScriptPubKey,

    /// Whether the output belongs to a coinbase transaction.
    #[serde(default)]
    pub coinbase: bool,
}

/// The fields of `getnetworkinfo` the client looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
struct NetworkInfo {
    version: u32,
}

/// The `scriptPubKey` object of `gettxout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    /// The script in hex.
    pub hex: ScriptBuf,
}

/// Read-only calls against the node.
#[async_trait]
pub trait Reader: Send + Sync + 'static {
    /// Version of the node software, e.g. `280000` for Bitcoin Core 28.0.
    async fn get_node_version(&self) -> ClientResult<u32>;

    /// Height of the best chain tip.
    async fn get_block_count(&self) -> ClientResult<u64>;

    /// Hash of the best-chain block at `height`.
    async fn get_block_hash(&self, height: u64) -> ClientResult<BlockHash>;

    /// The block with the given hash.
    async fn get_block(&self, hash: &BlockHash) -> ClientResult<Block>;

    /// The output `vout` of `txid` if it is unspent, `None` if it is spent or never existed.
    ///
    /// With `include_mempool`, outputs spent by mempool transactions count as spent.
    async fn get_tx_out(
        &self,
        txid: &Txid,
        vout: u32,
        include_mempool: bool,
    ) -> ClientResult<Option<UtxoInfo>>;

    /// Txids of every transaction in the mempool.
    async fn get_raw_mempool(&self) -> ClientResult<Vec<Txid>>;

    /// A mempool transaction, or any transaction when the node keeps a transaction index.
    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction>;
}

/// Transaction broadcasting.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    /// Submits `tx` to the node's mempool and returns its txid.
    async fn send_raw_transaction(&self, tx: &Transaction) -> ClientResult<Txid>;
}

/// JSON-RPC client of a `bitcoind` node, authenticated with HTTP basic auth.
#[derive(Clone)]
pub struct BitcoinRpcClient {
    client: HttpClient,
    url: String,
}

impl fmt::Debug for BitcoinRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitcoinRpcClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl BitcoinRpcClient {
    /// Builds a client for `url`. No request is made.
    pub fn new(url: &str, user: &str, password: &str, timeout: Duration) -> ClientResult<Self> {
        let credentials = STANDARD.encode(format!("{user}:{password}"));
        let auth = HeaderValue::from_str(&format!("Basic {credentials}"))
            .map_err(|e| ClientError::Transport(format!("invalid credentials: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", auth);

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(timeout)
            .build(url)
            .map_err(ClientError::from)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Reader for BitcoinRpcClient {
    async fn get_node_version(&self) -> ClientResult<u32> {
        let info: NetworkInfo = self.client.request("getnetworkinfo", rpc_params![]).await?;
        Ok(info.version)
    }

    async fn get_block_count(&self) -> ClientResult<u64> {
        Ok(self.client.request("getblockcount", rpc_params![]).await?)
    }

    async fn get_block_hash(&self, height: u64) -> ClientResult<BlockHash> {
        Ok(self
            .client
            .request("getblockhash", rpc_params![height])
            .await?)
    }

    async fn get_block(&self, hash: &BlockHash) -> ClientResult<Block> {
        let raw: String = self.client.request("getblock", rpc_params![hash, 0]).await?;
        trace!(%hash, size = raw.len() / 2, "fetched block");

        deserialize_hex(&raw).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get_tx_out(
        &self,
        txid: &Txid,
        vout: u32,
        include_mempool: bool,
    ) -> ClientResult<Option<UtxoInfo>> {
        Ok(self
            .client
            .request("gettxout", rpc_params![txid, vout, include_mempool])
            .await?)
    }

    async fn get_raw_mempool(&self) -> ClientResult<Vec<Txid>> {
        Ok(self.client.request("getrawmempool", rpc_params![]).await?)
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction> {
        let raw: String = self
            .client
            .request("getrawtransaction", rpc_params![txid, false])
            .await?;

        deserialize_hex(&raw).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Broadcaster for BitcoinRpcClient {
    async fn send_raw_transaction(&self, tx: &Transaction) -> ClientResult<Txid> {
        let raw = serialize_hex(tx);
        trace!(txid = %tx.compute_txid(), %raw, "broadcasting transaction");

        Ok(self
            .client
            .request("sendrawtransaction", rpc_params![raw])
            .await?)
    }
}
