//! Core value types shared by the chain index, rule engine, coin view and mempool

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain_index::ChainedHeader;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type
pub type Natural = u64;

/// Integer type (monetary amounts)
pub type Integer = i64;

/// Reference to a transaction output: (txid, index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: Natural,
}

impl OutPoint {
    pub fn new(hash: Hash, index: Natural) -> Self {
        Self { hash, index }
    }

    /// The prevout carried by coinbase inputs.
    pub fn null() -> Self {
        Self { hash: [0u8; 32], index: 0xffffffff }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == 0xffffffff
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: Natural,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Integer,
    pub script_pubkey: ByteString,
}

/// Transactions are immutable once built; identity is the double-SHA256 of
/// their serialization (see [`crate::hashing::txid`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: Natural,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: Natural,
}

/// Block header.
///
/// `signature` is only populated under proof-of-authority. It signs the
/// header hash and is therefore not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: Integer,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: Natural,
    pub bits: Natural,
    pub nonce: Natural,
    #[serde(default)]
    pub signature: Option<ByteString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: Integer,
    pub script_pubkey: ByteString,
    /// Height of the block that created the output.
    pub height: Natural,
    pub is_coinbase: bool,
}

/// Plain outpoint -> coin mapping, used for prefetched views and snapshots.
pub type UtxoSet = HashMap<OutPoint, Coin>;

/// Coins destroyed by a block, needed to resurrect them on disconnect.
///
/// Outputs created and spent inside the same block are not recorded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UndoSet {
    pub height: Natural,
    pub spent: Vec<(OutPoint, Coin)>,
}

/// What happens to undo data when a set of coin changes is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoUpdate {
    /// Block connected: keep its undo data.
    Record { block: Hash, undo: UndoSet },
    /// Block disconnected: its undo data is consumed.
    Discard { block: Hash },
}

/// The effect of connecting or disconnecting one block on the coin set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinChanges {
    pub spent: Vec<OutPoint>,
    pub created: Vec<(OutPoint, Coin)>,
    pub undo: UndoUpdate,
}

/// Notification payload for connected and disconnected blocks.
#[derive(Debug, Clone)]
pub struct ChainedHeaderBlock {
    pub header: ChainedHeader,
    pub block: Arc<Block>,
}
