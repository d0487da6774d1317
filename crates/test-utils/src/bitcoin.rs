//! Module to generate arbitrary base-chain values for testing.
use bitcoin::{
    absolute::LockTime,
    block,
    hashes::Hash,
    key::rand::{rngs::OsRng, Rng},
    script::Builder,
    transaction::Version,
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};

/// Generates a random transaction ID.
pub fn generate_txid() -> Txid {
    let mut txid = [0u8; 32];
    OsRng.fill(&mut txid);

    Txid::from_slice(&txid).expect("should be able to generate arbitrary txid")
}

/// Generates a random outpoint with a small output index.
pub fn generate_outpoint() -> OutPoint {
    OutPoint {
        txid: generate_txid(),
        vout: OsRng.gen_range(0..4),
    }
}

/// Generates a coinbase transaction carrying `height` in its scriptSig as required by BIP34.
///
/// A random extra push keeps coinbases of competing blocks at the same height distinct.
pub fn generate_coinbase(height: u64) -> Transaction {
    let extra: u32 = OsRng.gen();
    let script_sig = Builder::new()
        .push_int(height as i64)
        .push_int(extra as i64)
        .into_script();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Creates a block at `height` on top of `prev_blockhash` holding a coinbase followed by `txs`.
///
/// The merkle root is computed so that the block hash commits to the transactions.
pub fn generate_block(height: u64, prev_blockhash: BlockHash, txs: Vec<Transaction>) -> Block {
    let mut txdata = Vec::with_capacity(txs.len() + 1);
    txdata.push(generate_coinbase(height));
    txdata.extend(txs);

    let mut block = Block {
        header: block::Header {
            version: block::Version::TWO,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: height as u32,
            bits: CompactTarget::from_consensus(0),
            nonce: OsRng.gen(),
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }

    block
}

/// Creates a test block with proper BIP34 height encoding and no other transactions.
pub fn generate_block_with_height(height: u64) -> Block {
    generate_block(height, BlockHash::all_zeros(), vec![])
}

/// Generates `count` empty blocks linked to each other, the first one at `start_height` on top of
/// `prev_blockhash`.
pub fn generate_chain(start_height: u64, count: usize, prev_blockhash: BlockHash) -> Vec<Block> {
    let mut prev = prev_blockhash;

    (0..count as u64)
        .map(|offset| {
            let block = generate_block(start_height + offset, prev, vec![]);
            prev = block.block_hash();
            block
        })
        .collect()
}

/// Generates a transaction spending a random outpoint whose only output is `script_pubkey`.
pub fn generate_tx_with_output(script_pubkey: ScriptBuf) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: generate_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey,
        }],
    }
}

/// Creates a transaction spending `previous_output` with the given input `sequence`.
pub fn generate_spending_tx(previous_output: OutPoint, sequence: Sequence) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::from_slice(&[[0u8; 64]]),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(OsRng.gen_range(1_000..100_000)),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Generates a random transaction.
pub fn generate_tx(num_inputs: usize, num_outputs: usize) -> Transaction {
    let inputs = (0..num_inputs)
        .map(|_| TxIn {
            previous_output: generate_outpoint(),
            witness: Witness::new(),
            sequence: Sequence(0),
            script_sig: ScriptBuf::new(),
        })
        .collect();

    let outputs = (0..num_outputs)
        .map(|_| {
            let value: u32 = OsRng.gen();

            TxOut {
                value: Amount::from_sat(value as u64),
                script_pubkey: ScriptBuf::new(),
            }
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: outputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_linked_and_heights_are_encoded() {
        let blocks = generate_chain(100, 5, BlockHash::all_zeros());

        for pair in blocks.windows(2) {
            assert_eq!(pair[1].header.prev_blockhash, pair[0].block_hash());
        }
        for (offset, block) in blocks.iter().enumerate() {
            assert_eq!(block.bip34_block_height().unwrap(), 100 + offset as u64);
        }
    }

    #[test]
    fn competing_blocks_differ() {
        let a = generate_block(7, BlockHash::all_zeros(), vec![]);
        let b = generate_block(7, BlockHash::all_zeros(), vec![]);

        assert_ne!(a.block_hash(), b.block_hash());
    }
}
