//! The spendability check at the heart of the slasher.

use bitcoin::{consensus, Transaction};
use btc_follower::rpc::Reader;
use tracing::trace;

use crate::errors::SlasherError;

/// Whether output `out_idx` of the consensus-encoded transaction `tx_bytes` can still be spent.
///
/// Outputs spent by a mempool transaction count as spent. Parse and RPC failures are returned as
/// errors and not retried here. No state is changed.
pub async fn is_output_spendable<R: Reader>(
    rpc: &R,
    tx_bytes: &[u8],
    out_idx: u32,
) -> Result<bool, SlasherError> {
    let tx: Transaction = consensus::deserialize(tx_bytes)?;
    let txid = tx.compute_txid();

    let utxo = rpc.get_tx_out(&txid, out_idx, true).await?;
    trace!(%txid, %out_idx, ?utxo, "checked output");

    Ok(utxo.is_some())
}

#[cfg(test)]
mod tests {
    use anchor_watch_test_utils::bitcoin::{generate_spending_tx, generate_tx};
    use bitcoin::{OutPoint, Sequence};
    use btc_follower::mock::MockBtcRpc;

    use super::*;

    #[tokio::test]
    async fn unspent_output_is_spendable() {
        let rpc = MockBtcRpc::new(100);
        let tx = generate_tx(1, 2);
        rpc.add_utxo(OutPoint::new(tx.compute_txid(), 1), 6);

        let bytes = consensus::serialize(&tx);
        assert!(is_output_spendable(&rpc, &bytes, 1).await.unwrap());
        assert!(!is_output_spendable(&rpc, &bytes, 0).await.unwrap());
    }

    #[tokio::test]
    async fn mempool_spend_makes_output_unspendable() {
        let rpc = MockBtcRpc::new(100);
        let tx = generate_tx(1, 1);
        let outpoint = OutPoint::new(tx.compute_txid(), 0);
        rpc.add_utxo(outpoint, 6);
        rpc.add_mempool_tx(generate_spending_tx(outpoint, Sequence::MAX));

        let spendable = is_output_spendable(&rpc, &consensus::serialize(&tx), 0).await;
        assert!(!spendable.unwrap());
    }

    #[tokio::test]
    async fn rpc_failure_is_an_error() {
        let rpc = MockBtcRpc::new(100);
        rpc.set_offline(true);
        let tx = generate_tx(1, 1);

        let result = is_output_spendable(&rpc, &consensus::serialize(&tx), 0).await;
        assert!(matches!(result, Err(SlasherError::Rpc(_))));
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let rpc = MockBtcRpc::new(100);

        let result = is_output_spendable(&rpc, &[0x01, 0x02, 0x03], 0).await;
        assert!(matches!(result, Err(SlasherError::Decode(_))));
        assert_eq!(rpc.calls(), 0);
    }
}
