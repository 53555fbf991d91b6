//! Shared chain builder for the integration tests
#![allow(dead_code)]

use consensus_core::block::coinbase_height_prefix;
use consensus_core::chain_index::ChainedHeader;
use consensus_core::config::ConsensusConfig;
use consensus_core::constants::*;
use consensus_core::consensus_loop::ConsensusLoop;
use consensus_core::context::{ConsensusContext, ConsensusParams, ManualClock};
use consensus_core::hashing::{block_hash, block_merkle_root, txid};
use consensus_core::network::{PeerId, RecordingRelay, SubmitOutcome};
use consensus_core::pow::check_proof_of_work;
use consensus_core::signals::{BlockConnected, BlockDisconnected, Signals, TransactionReceived};
use consensus_core::storage::{MemoryBlockStore, MemoryCoinStore};
use consensus_core::types::*;
use parking_lot::Mutex;
use std::sync::Arc;

pub const GENESIS_TIME: Natural = 1_600_000_000;
pub const MATURITY: Natural = 2;
pub const FEE: Integer = 10_000;
pub const PEER: Option<PeerId> = Some(PeerId(1));

/// What subscribers saw, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(Hash, Natural),
    Disconnected(Hash, Natural),
    Transaction(Hash),
}

pub struct TestNode {
    pub node: ConsensusLoop,
    pub relay: Arc<RecordingRelay>,
    pub coin_store: Arc<MemoryCoinStore>,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

pub fn test_config() -> ConsensusConfig {
    let mut config = ConsensusConfig::default();
    config.mempool.require_standard = false;
    config
}

pub fn test_node() -> TestNode {
    test_node_with(test_config())
}

pub fn test_node_with(config: ConsensusConfig) -> TestNode {
    let params = ConsensusParams::regtest(GENESIS_TIME).with_coinbase_maturity(MATURITY);
    let context = ConsensusContext::new(params, config, Arc::new(ManualClock::new(GENESIS_TIME + 1_000_000)));
    let relay = Arc::new(RecordingRelay::new());
    let coin_store = Arc::new(MemoryCoinStore::new());
    let signals = Arc::new(Signals::new());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    signals.subscribe(move |event: &BlockConnected| {
        log.lock().push(Seen::Connected(event.0.header.hash, event.0.header.height))
    });
    let log = seen.clone();
    signals.subscribe(move |event: &BlockDisconnected| {
        log.lock().push(Seen::Disconnected(event.0.header.hash, event.0.header.height))
    });
    let log = seen.clone();
    signals.subscribe(move |event: &TransactionReceived| log.lock().push(Seen::Transaction(txid(&event.0))));

    let node = ConsensusLoop::new(
        context,
        coin_store.clone(),
        Arc::new(MemoryBlockStore::new()),
        relay.clone(),
        signals,
    )
    .unwrap();
    TestNode { node, relay, coin_store, seen }
}

impl TestNode {
    pub fn connected_heights(&self) -> Vec<Natural> {
        self.seen
            .lock()
            .iter()
            .filter_map(|event| match event {
                Seen::Connected(_, height) => Some(*height),
                _ => None,
            })
            .collect()
    }

    pub fn block_events(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .iter()
            .filter(|event| !matches!(event, Seen::Transaction(_)))
            .cloned()
            .collect()
    }

    /// Extend the active tip by `count` mined blocks.
    pub fn extend(&self, count: usize, salt: Integer) -> Vec<Block> {
        let mut blocks = Vec::new();
        for _ in 0..count {
            let block = child(&self.node.tip(), salt, vec![]);
            assert_eq!(self.node.submit_block(block.clone(), PEER).unwrap(), SubmitOutcome::Accepted);
            blocks.push(block);
        }
        blocks
    }

    pub fn chained(&self, block: &Block) -> ChainedHeader {
        self.node.header(&block_hash(&block.header)).unwrap()
    }
}

pub fn coinbase(height: Natural, value: Integer) -> Transaction {
    let mut script_sig = coinbase_height_prefix(height);
    script_sig.push(0x00);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
        outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// Mined child of `parent`; `salt` lowers the coinbase value so that sibling
/// blocks hash differently.
pub fn child(parent: &ChainedHeader, salt: Integer, txs: Vec<Transaction>) -> Block {
    let fees: Integer = txs.len() as Integer * FEE;
    let mut transactions = vec![coinbase(parent.height + 1, 50 * COIN + fees - salt)];
    transactions.extend(txs);

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: parent.hash,
            merkle_root: [0; 32],
            timestamp: parent.header.timestamp + 600,
            bits: parent.header.bits,
            nonce: 0,
            signature: None,
        },
        transactions,
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    mine(&mut block);
    block
}

pub fn mine(block: &mut Block) {
    while !check_proof_of_work(&block_hash(&block.header), block.header.bits, REGTEST_POW_LIMIT_BITS) {
        block.header.nonce += 1;
    }
}

/// Spend output `index` of `prev` into a single anyone-can-spend output,
/// paying [`FEE`].
pub fn spend(prev: &Transaction, index: Natural) -> Transaction {
    let value = prev.outputs[index as usize].value - FEE;
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::new(txid(prev), index),
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// Like [`spend`] but split into `count` equal outputs.
pub fn split(prev: &Transaction, index: Natural, count: usize) -> Transaction {
    let mut tx = spend(prev, index);
    let total = tx.outputs[0].value;
    let share = total / count as Integer;
    tx.outputs = (0..count).map(|_| TransactionOutput { value: share, script_pubkey: vec![0x51] }).collect();
    tx
}
