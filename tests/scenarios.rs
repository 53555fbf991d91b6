//! End-to-end node scenarios: linear sync, fork switch, mempool double
//! spend, mutated bodies and transactions falling out after a disconnect.

mod common;

use common::*;
use consensus_core::consensus_loop::BlockStatus;
use consensus_core::hashing::{block_hash, txid};
use consensus_core::network::{PeerId, SubmitOutcome};
use consensus_core::storage::CoinStore;
use consensus_core::types::*;
use std::collections::HashSet;

#[test]
fn test_linear_sync_of_five_blocks() {
    let t = test_node();
    let blocks = t.extend(5, 0);

    assert_eq!(t.node.height(), 5);
    assert_eq!(t.node.tip().hash, block_hash(&blocks[4].header));
    assert_eq!(t.connected_heights(), vec![1, 2, 3, 4, 5]);
    for (height, block) in blocks.iter().enumerate() {
        assert_eq!(t.node.header_at(height as Natural + 1).map(|header| header.hash), Some(block_hash(&block.header)));
    }

    t.node.flush().unwrap();
    let expected: HashSet<OutPoint> =
        blocks.iter().map(|block| OutPoint::new(txid(&block.transactions[0]), 0)).collect();
    let stored: HashSet<OutPoint> = t.coin_store.utxo_set().into_keys().collect();
    assert_eq!(stored, expected);
    assert_eq!(t.coin_store.tip().unwrap(), Some(t.node.tip().hash));

    // next spend height is 6: the height 4 coinbase has matured, height 5 has not
    let mature = spend(&blocks[3].transactions[0], 0);
    assert_eq!(t.node.submit_transaction(mature, PEER).unwrap(), SubmitOutcome::Accepted);
    let immature = spend(&blocks[4].transactions[0], 0);
    assert_eq!(
        t.node.submit_transaction(immature, PEER).unwrap().reject_code(),
        Some("bad-txns-premature-spend-of-coinbase")
    );
}

#[test]
fn test_longer_fork_replaces_active_branch() {
    let t = test_node();
    let trunk = t.extend(2, 0);
    let fork_point = t.chained(&trunk[1]);

    let fork_a = t.extend(3, 1);
    assert_eq!(t.node.height(), 5);
    assert_eq!(t.node.tip().hash, block_hash(&fork_a[2].header));

    let mut fork_b = Vec::new();
    let mut parent = fork_point;
    for _ in 0..4 {
        let block = child(&parent, 2, vec![]);
        t.node.submit_block(block.clone(), PEER).unwrap();
        parent = t.chained(&block);
        fork_b.push(block);
    }

    assert_eq!(t.node.height(), 6);
    assert_eq!(t.node.tip().hash, block_hash(&fork_b[3].header));
    for block in &fork_b {
        assert_eq!(t.node.block_status(&block_hash(&block.header)), Some(BlockStatus::FullyValidated));
    }

    let events = t.block_events();
    let reorg = &events[5..];
    let expected: Vec<Seen> = fork_a
        .iter()
        .rev()
        .zip([5, 4, 3])
        .map(|(block, height)| Seen::Disconnected(block_hash(&block.header), height))
        .chain(fork_b.iter().zip(3..).map(|(block, height)| Seen::Connected(block_hash(&block.header), height)))
        .collect();
    assert_eq!(reorg, expected.as_slice());

    let fork_a_coin = OutPoint::new(txid(&fork_a[0].transactions[0]), 0);
    assert_eq!(t.node.coin(&fork_a_coin).unwrap(), None);
}

#[test]
fn test_mempool_rejects_spend_of_confirmed_coin() {
    let t = test_node();
    let blocks = t.extend(3, 0);
    let funding = &blocks[0].transactions[0];

    let confirmed = spend(funding, 0);
    let block = child(&t.node.tip(), 0, vec![confirmed]);
    assert_eq!(t.node.submit_block(block, PEER).unwrap(), SubmitOutcome::Accepted);

    let other = spend(&blocks[1].transactions[0], 0);
    assert_eq!(t.node.submit_transaction(other, PEER).unwrap(), SubmitOutcome::Accepted);
    let size_before = t.node.mempool_size();

    let mut double = spend(funding, 0);
    double.outputs[0].value -= 1;
    let outcome = t.node.submit_transaction(double.clone(), Some(PeerId(5))).unwrap();

    assert_eq!(outcome.reject_code(), Some("bad-txns-inputs-missingorspent"));
    assert!(matches!(outcome, SubmitOutcome::Rejected { misbehavior: None, .. }));
    assert_eq!(t.node.mempool_size(), size_before);
    assert!(!t.node.mempool_contains(&txid(&double)));
    assert!(t.relay.penalties_for(PeerId(5)).is_empty());
}

#[test]
fn test_mutated_body_rejected_before_coin_rules() {
    let t = test_node();
    t.extend(1, 0);
    let tip_before = t.node.tip();
    t.node.flush().unwrap();
    let coins_before = t.coin_store.utxo_set();

    // a body that would also fail coin rules, were it to get that far
    let mut honest = child(&t.node.tip(), 0, vec![]);
    honest.transactions[0].outputs[0].value = 60 * consensus_core::constants::COIN;
    honest.header.merkle_root = consensus_core::hashing::block_merkle_root(&honest).0;
    mine(&mut honest);
    let advertised = block_hash(&honest.header);
    assert_eq!(t.node.submit_header(honest.header.clone(), Some(PeerId(6))).unwrap(), SubmitOutcome::Accepted);

    let mut mutated = honest.clone();
    mutated.transactions[0].outputs[0].value -= 1;
    let outcome = t.node.deliver_block(advertised, mutated, Some(PeerId(6))).unwrap();
    assert_eq!(outcome.reject_code(), Some("bad-txnmrklroot"));

    let mut reheadered = honest.clone();
    reheadered.header.nonce += 1;
    let outcome = t.node.deliver_block(advertised, reheadered, Some(PeerId(6))).unwrap();
    assert_eq!(outcome.reject_code(), Some("bad-blk-hash-mismatch"));

    assert_eq!(t.relay.penalties_for(PeerId(6)), vec![100, 100]);
    assert_eq!(t.node.tip(), tip_before);
    assert_eq!(t.node.block_status(&advertised), Some(BlockStatus::BodyRequested));
    t.node.flush().unwrap();
    assert_eq!(t.coin_store.utxo_set(), coins_before);
    assert_eq!(t.connected_heights(), vec![1]);
}

#[test]
fn test_disconnected_transaction_with_immature_input_is_dropped() {
    let t = test_node();
    let blocks = t.extend(2, 0);

    // spends the height 1 coinbase at height 3, the first height it is mature
    let x = spend(&blocks[0].transactions[0], 0);
    let carrying = child(&t.node.tip(), 0, vec![x.clone()]);
    assert_eq!(t.node.submit_block(carrying, PEER).unwrap(), SubmitOutcome::Accepted);
    let events_before = t.seen.lock().len();

    // back to height 1: the next spend height is 2 and the coinbase is immature again
    assert!(t.node.invalidate_block(&block_hash(&blocks[1].header)).unwrap());
    assert_eq!(t.node.height(), 1);
    assert!(!t.node.mempool_contains(&txid(&x)));
    assert_eq!(t.node.mempool_size(), 0);
    assert!(!t.seen.lock()[events_before..].iter().any(|event| matches!(event, Seen::Transaction(_))));
    t.node.check_mempool_consistency().unwrap();

    let outcome = t.node.submit_transaction(x.clone(), PEER).unwrap();
    assert_eq!(outcome.reject_code(), Some("bad-txns-premature-spend-of-coinbase"));
    assert!(!t.node.mempool_contains(&txid(&x)));
}
