//! A scripted in-memory node for tests.
//!
//! The mock keeps a best chain, a mempool and a set of unspent outputs that tests mutate
//! directly. It can be taken offline to simulate a node outage and can be told to fail a given
//! number of calls or broadcasts.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use bitcoin::{hashes::Hash, Amount, Block, BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use parking_lot::Mutex;

use crate::{
    constants::MIN_NODE_VERSION,
    rpc::{Broadcaster, ClientError, ClientResult, Reader, ScriptPubKey, UtxoInfo},
};

#[derive(Debug, Default)]
struct MockState {
    base_height: u64,
    chain: Vec<Block>,
    mempool: Vec<Transaction>,
    utxos: HashMap<OutPoint, UtxoInfo>,
    offline: bool,
    failures: VecDeque<ClientError>,
    broadcast_failures: VecDeque<ClientError>,
    broadcasts: Vec<Transaction>,
    calls: usize,
    node_version: Option<u32>,
}

impl MockState {
    fn tip_height(&self) -> u64 {
        self.base_height + self.chain.len() as u64 - 1
    }

    fn tip_hash(&self) -> BlockHash {
        self.chain
            .last()
            .map(Block::block_hash)
            .unwrap_or_else(BlockHash::all_zeros)
    }

    fn check(&mut self) -> ClientResult<()> {
        self.calls += 1;

        if self.offline {
            return Err(ClientError::Transport("connection refused".to_string()));
        }
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str) -> ClientError {
    ClientError::Server {
        code: -5,
        message: format!("{what} not found"),
    }
}

/// In-memory stand-in for a `bitcoind` node.
#[derive(Debug, Clone, Default)]
pub struct MockBtcRpc {
    state: Arc<Mutex<MockState>>,
}

impl MockBtcRpc {
    /// Creates a node whose chain consists of a single empty block at `base_height`.
    pub fn new(base_height: u64) -> Self {
        let genesis = Block {
            header: bitcoin::block::Header {
                version: bitcoin::block::Version::TWO,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                time: 0,
                bits: bitcoin::CompactTarget::from_consensus(0),
                nonce: base_height as u32,
            },
            txdata: vec![],
        };

        let state = MockState {
            base_height,
            chain: vec![genesis],
            ..Default::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Height of the tip.
    pub fn tip_height(&self) -> u64 {
        self.state.lock().tip_height()
    }

    /// Hash of the tip.
    pub fn tip_hash(&self) -> BlockHash {
        self.state.lock().tip_hash()
    }

    /// Appends `block` to the best chain and removes its transactions from the mempool.
    pub fn mine(&self, block: Block) {
        let mut state = self.state.lock();
        let mined = block
            .txdata
            .iter()
            .map(Transaction::compute_txid)
            .collect::<Vec<_>>();
        state
            .mempool
            .retain(|tx| !mined.contains(&tx.compute_txid()));
        state.chain.push(block);
    }

    /// Replaces every block from `height` upwards with `blocks`.
    pub fn reorg(&self, height: u64, blocks: Vec<Block>) {
        let mut state = self.state.lock();
        let keep = (height - state.base_height) as usize;
        state.chain.truncate(keep);
        state.chain.extend(blocks);
    }

    /// Makes the node report `version`, [`MIN_NODE_VERSION`] when never set.
    pub fn set_node_version(&self, version: u32) {
        self.state.lock().node_version = Some(version);
    }

    /// Makes every call fail with a transport error while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Makes the next calls fail with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.state.lock().failures.extend(errors);
    }

    /// Adds a transaction to the mempool.
    pub fn add_mempool_tx(&self, tx: Transaction) {
        self.state.lock().mempool.push(tx);
    }

    /// Registers an unspent output with the given number of confirmations.
    pub fn add_utxo(&self, outpoint: OutPoint, confirmations: u32) {
        let mut state = self.state.lock();
        let info = UtxoInfo {
            best_block: state.tip_hash(),
            confirmations,
            value: Amount::from_sat(100_000),
            script_pubkey: ScriptPubKey {
                hex: ScriptBuf::new(),
            },
            coinbase: false,
        };
        state.utxos.insert(outpoint, info);
    }

    /// Marks an output as spent in a block.
    pub fn spend_utxo(&self, outpoint: &OutPoint) {
        self.state.lock().utxos.remove(outpoint);
    }

    /// Makes the next broadcasts fail with `errors`, in order.
    pub fn fail_next_broadcasts(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.state.lock().broadcast_failures.extend(errors);
    }

    /// Every transaction successfully broadcast so far.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    /// Number of calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

#[async_trait]
impl Reader for MockBtcRpc {
    async fn get_node_version(&self) -> ClientResult<u32> {
        let mut state = self.state.lock();
        state.check()?;
        Ok(state.node_version.unwrap_or(MIN_NODE_VERSION))
    }

    async fn get_block_count(&self) -> ClientResult<u64> {
        let mut state = self.state.lock();
        state.check()?;
        Ok(state.tip_height())
    }

    async fn get_block_hash(&self, height: u64) -> ClientResult<BlockHash> {
        let mut state = self.state.lock();
        state.check()?;

        height
            .checked_sub(state.base_height)
            .and_then(|index| state.chain.get(index as usize))
            .map(Block::block_hash)
            .ok_or_else(|| ClientError::Server {
                code: -8,
                message: "Block height out of range".to_string(),
            })
    }

    async fn get_block(&self, hash: &BlockHash) -> ClientResult<Block> {
        let mut state = self.state.lock();
        state.check()?;

        state
            .chain
            .iter()
            .find(|block| block.block_hash() == *hash)
            .cloned()
            .ok_or_else(|| not_found("block"))
    }

    async fn get_tx_out(
        &self,
        txid: &Txid,
        vout: u32,
        include_mempool: bool,
    ) -> ClientResult<Option<UtxoInfo>> {
        let mut state = self.state.lock();
        state.check()?;

        let outpoint = OutPoint::new(*txid, vout);
        let spent_in_mempool = include_mempool
            && state
                .mempool
                .iter()
                .any(|tx| tx.input.iter().any(|i| i.previous_output == outpoint));

        if spent_in_mempool {
            return Ok(None);
        }
        Ok(state.utxos.get(&outpoint).cloned())
    }

    async fn get_raw_mempool(&self) -> ClientResult<Vec<Txid>> {
        let mut state = self.state.lock();
        state.check()?;

        Ok(state.mempool.iter().map(Transaction::compute_txid).collect())
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction> {
        let mut state = self.state.lock();
        state.check()?;

        state
            .mempool
            .iter()
            .find(|tx| tx.compute_txid() == *txid)
            .cloned()
            .ok_or_else(|| not_found("transaction"))
    }
}

#[async_trait]
impl Broadcaster for MockBtcRpc {
    async fn send_raw_transaction(&self, tx: &Transaction) -> ClientResult<Txid> {
        let mut state = self.state.lock();
        state.check()?;

        if let Some(err) = state.broadcast_failures.pop_front() {
            return Err(err);
        }

        state.broadcasts.push(tx.clone());
        state.mempool.push(tx.clone());
        Ok(tx.compute_txid())
    }
}
