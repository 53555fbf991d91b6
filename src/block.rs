//! Block-level helpers: coinbase commitments, sigop totals and coin effects

use crate::hashing::txid;
use crate::script::is_unspendable;
use crate::transaction::{is_coinbase, legacy_sigop_count};
use crate::types::*;
use std::collections::HashSet;

/// Minimal little-endian script-number encoding
fn script_number(value: Natural) -> ByteString {
    let mut bytes = Vec::new();
    let mut rest = value;
    while rest > 0 {
        bytes.push((rest & 0xff) as u8);
        rest >>= 8;
    }
    if bytes.last().map_or(false, |last| last & 0x80 != 0) {
        bytes.push(0x00);
    }
    bytes
}

/// Prefix a coinbase script sig must start with at `height`: a single push
/// of the height as a script number.
pub fn coinbase_height_prefix(height: Natural) -> ByteString {
    let number = script_number(height);
    let mut prefix = Vec::with_capacity(number.len() + 1);
    prefix.push(number.len() as u8);
    prefix.extend(number);
    prefix
}

/// Coinbase commits to `height`
pub fn coinbase_commits_height(coinbase: &Transaction, height: Natural) -> bool {
    let prefix = coinbase_height_prefix(height);
    coinbase
        .inputs
        .first()
        .map_or(false, |input| input.script_sig.starts_with(&prefix))
}

/// Legacy sigops of every transaction in the block
pub fn block_sigop_count(block: &Block) -> usize {
    block.transactions.iter().map(legacy_sigop_count).sum()
}

/// Every outpoint spent by the block's non-coinbase transactions
pub fn block_prevouts(block: &Block) -> Vec<OutPoint> {
    block
        .transactions
        .iter()
        .filter(|tx| !is_coinbase(tx))
        .flat_map(|tx| tx.inputs.iter().map(|input| input.prevout.clone()))
        .collect()
}

/// Spendable outputs of a transaction as coins created at `height`
pub fn output_coins(tx: &Transaction, id: Hash, height: Natural) -> Vec<(OutPoint, Coin)> {
    let coinbase = is_coinbase(tx);
    tx.outputs
        .iter()
        .enumerate()
        .filter(|(_, output)| !is_unspendable(&output.script_pubkey))
        .map(|(index, output)| {
            (
                OutPoint::new(id, index as Natural),
                Coin {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                    is_coinbase: coinbase,
                },
            )
        })
        .collect()
}

/// ApplyTransaction: 𝒯𝒳 × 𝒰𝒮 → 𝒰𝒮
///
/// For transaction tx and a working coin set us whose inputs were already
/// resolved:
/// 1. Remove every spent prevout from us; coins that existed before the
///    block are recorded in `undo`
/// 2. Add the spendable outputs of tx
pub fn apply_transaction(
    tx: &Transaction,
    id: Hash,
    height: Natural,
    view: &mut UtxoSet,
    created_in_block: &mut HashSet<OutPoint>,
    undo: &mut UndoSet,
) {
    if !is_coinbase(tx) {
        for input in &tx.inputs {
            if let Some(coin) = view.remove(&input.prevout) {
                if !created_in_block.remove(&input.prevout) {
                    undo.spent.push((input.prevout.clone(), coin));
                }
            }
        }
    }

    for (outpoint, coin) in output_coins(tx, id, height) {
        created_in_block.insert(outpoint.clone());
        view.insert(outpoint, coin);
    }
}

/// Outputs of `block` that survive the block (not spent inside it)
fn surviving_outputs(block: &Block, height: Natural) -> Vec<(OutPoint, Coin)> {
    let spent_in_block: HashSet<OutPoint> = block_prevouts(block).into_iter().collect();
    block
        .transactions
        .iter()
        .flat_map(|tx| output_coins(tx, txid(tx), height))
        .filter(|(outpoint, _)| !spent_in_block.contains(outpoint))
        .collect()
}

/// Coin effect of connecting a block whose undo record is known
pub fn connect_changes(hash: Hash, block: &Block, undo: UndoSet) -> CoinChanges {
    CoinChanges {
        spent: undo.spent.iter().map(|(outpoint, _)| outpoint.clone()).collect(),
        created: surviving_outputs(block, undo.height),
        undo: UndoUpdate::Record { block: hash, undo },
    }
}

/// Coin effect of disconnecting a block: its surviving outputs disappear and
/// the coins it consumed come back.
pub fn disconnect_changes(hash: Hash, block: &Block, undo: UndoSet) -> CoinChanges {
    CoinChanges {
        spent: surviving_outputs(block, undo.height)
            .into_iter()
            .map(|(outpoint, _)| outpoint)
            .collect(),
        created: undo.spent,
        undo: UndoUpdate::Discard { block: hash },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;

    fn coinbase(height: Natural) -> Transaction {
        let mut script_sig = coinbase_height_prefix(height);
        script_sig.push(0x00);
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
            outputs: vec![
                TransactionOutput { value: 50, script_pubkey: vec![0x51] },
                TransactionOutput { value: 0, script_pubkey: vec![OP_RETURN, 0x01, 0x02] },
            ],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: Integer) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout, script_sig: vec![], sequence: SEQUENCE_FINAL }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn old_coin() -> Coin {
        Coin { value: 100, script_pubkey: vec![0x51], height: 1, is_coinbase: false }
    }

    #[test]
    fn test_coinbase_height_prefix() {
        assert_eq!(coinbase_height_prefix(1), vec![0x01, 0x01]);
        assert_eq!(coinbase_height_prefix(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(coinbase_height_prefix(0x1234), vec![0x02, 0x34, 0x12]);
        assert!(coinbase_commits_height(&coinbase(500), 500));
        assert!(!coinbase_commits_height(&coinbase(500), 501));
    }

    #[test]
    fn test_apply_transaction_records_only_preexisting_spends() {
        let old = OutPoint::new([1; 32], 0);
        let mut view = UtxoSet::new();
        view.insert(old.clone(), old_coin());

        let parent = spend(old.clone(), 90);
        let parent_id = txid(&parent);
        let child = spend(OutPoint::new(parent_id, 0), 80);

        let mut created = HashSet::new();
        let mut undo = UndoSet { height: 5, spent: vec![] };
        apply_transaction(&parent, parent_id, 5, &mut view, &mut created, &mut undo);
        apply_transaction(&child, txid(&child), 5, &mut view, &mut created, &mut undo);

        assert_eq!(undo.spent, vec![(old, old_coin())]);
        assert_eq!(view.len(), 1);
        assert!(view.contains_key(&OutPoint::new(txid(&child), 0)));
    }

    #[test]
    fn test_unspendable_outputs_are_not_coins() {
        let cb = coinbase(3);
        let coins = output_coins(&cb, txid(&cb), 3);
        assert_eq!(coins.len(), 1);
        assert!(coins[0].1.is_coinbase);
    }

    #[test]
    fn test_connect_and_disconnect_are_inverse() {
        let old = OutPoint::new([1; 32], 0);
        let parent = spend(old.clone(), 90);
        let child = spend(OutPoint::new(txid(&parent), 0), 80);
        let block = Block {
            header: crate::context::genesis_header(0, REGTEST_POW_LIMIT_BITS),
            transactions: vec![coinbase(5), parent, child.clone()],
        };
        let undo = UndoSet { height: 5, spent: vec![(old.clone(), old_coin())] };

        let connect = connect_changes([9; 32], &block, undo.clone());
        let disconnect = disconnect_changes([9; 32], &block, undo);

        assert_eq!(connect.spent, vec![old.clone()]);
        assert_eq!(connect.created.len(), 2); // coinbase output and child output
        assert!(connect.created.iter().any(|(o, _)| *o == OutPoint::new(txid(&child), 0)));

        let mut disconnect_spent = disconnect.spent.clone();
        let mut connect_created: Vec<OutPoint> = connect.created.iter().map(|(o, _)| o.clone()).collect();
        disconnect_spent.sort();
        connect_created.sort();
        assert_eq!(disconnect_spent, connect_created);
        assert_eq!(disconnect.created, vec![(old, old_coin())]);
        assert_eq!(disconnect.undo, UndoUpdate::Discard { block: [9; 32] });
    }

    #[test]
    fn test_block_prevouts_skip_coinbase() {
        let block = Block {
            header: crate::context::genesis_header(0, REGTEST_POW_LIMIT_BITS),
            transactions: vec![coinbase(1), spend(OutPoint::new([1; 32], 0), 1)],
        };
        assert_eq!(block_prevouts(&block), vec![OutPoint::new([1; 32], 0)]);
    }
}
