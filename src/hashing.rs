//! Content hashes and serialization sizes
//!
//! Transactions and headers are serialized in the familiar Bitcoin layout and
//! hashed with double SHA-256. The exact on-disk encoding belongs to the
//! storage layer; this layout only has to be deterministic.

use crate::constants::SIGHASH_ALL;
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};

/// Double SHA-256 of arbitrary data
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// Transaction identity
pub fn txid(tx: &Transaction) -> Hash {
    sha256d(&serialize_transaction(tx))
}

/// Block identity: hash of the header without its signature
pub fn block_hash(header: &BlockHeader) -> Hash {
    sha256d(&serialize_header(header))
}

/// Serialized transaction size in bytes
pub fn transaction_size(tx: &Transaction) -> usize {
    serialize_transaction(tx).len()
}

/// Serialized block size in bytes (80-byte header, count, transactions)
pub fn block_size(block: &Block) -> usize {
    80 + varint_len(block.transactions.len() as u64)
        + block.transactions.iter().map(transaction_size).sum::<usize>()
}

/// Merkle root over transaction ids.
///
/// Returns the root and whether the tree was mutated: two identical adjacent
/// hashes at any level mean a different transaction list yields the same
/// root (the odd-element duplication ambiguity).
pub fn merkle_root(txids: &[Hash]) -> (Hash, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }

    let mut mutated = false;
    let mut level: Vec<Hash> = txids.to_vec();

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 {
                if chunk[0] == chunk[1] {
                    mutated = true;
                }
                chunk[1]
            } else {
                chunk[0]
            };
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&left);
            combined[32..].copy_from_slice(&right);
            next.push(sha256d(&combined));
        }
        level = next;
    }

    (level[0], mutated)
}

/// Merkle root over a block's transactions
pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    let ids: Vec<Hash> = block.transactions.iter().map(txid).collect();
    merkle_root(&ids)
}

/// Digest signed by the input at `input_index`.
///
/// All other script sigs are blanked and the signing input carries the
/// script of the output it spends, followed by the hash type.
pub fn signature_hash(tx: &Transaction, input_index: usize, script_code: &[u8]) -> Hash {
    let mut copy = tx.clone();
    for (i, input) in copy.inputs.iter_mut().enumerate() {
        input.script_sig = if i == input_index {
            script_code.to_vec()
        } else {
            Vec::new()
        };
    }

    let mut data = serialize_transaction(&copy);
    data.extend_from_slice(&(SIGHASH_ALL as u32).to_le_bytes());
    sha256d(&data)
}

/// Display form of a hash: byte-reversed hex, as block explorers show it
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut data = Vec::new();

    data.extend_from_slice(&(tx.version as u32).to_le_bytes());

    data.extend_from_slice(&encode_varint(tx.inputs.len() as u64));
    for input in &tx.inputs {
        data.extend_from_slice(&input.prevout.hash);
        data.extend_from_slice(&(input.prevout.index as u32).to_le_bytes());
        data.extend_from_slice(&encode_varint(input.script_sig.len() as u64));
        data.extend_from_slice(&input.script_sig);
        data.extend_from_slice(&(input.sequence as u32).to_le_bytes());
    }

    data.extend_from_slice(&encode_varint(tx.outputs.len() as u64));
    for output in &tx.outputs {
        data.extend_from_slice(&(output.value as u64).to_le_bytes());
        data.extend_from_slice(&encode_varint(output.script_pubkey.len() as u64));
        data.extend_from_slice(&output.script_pubkey);
    }

    data.extend_from_slice(&(tx.lock_time as u32).to_le_bytes());
    data
}

pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut data = Vec::with_capacity(80);
    data.extend_from_slice(&(header.version as u32).to_le_bytes());
    data.extend_from_slice(&header.prev_block_hash);
    data.extend_from_slice(&header.merkle_root);
    data.extend_from_slice(&(header.timestamp as u32).to_le_bytes());
    data.extend_from_slice(&(header.bits as u32).to_le_bytes());
    data.extend_from_slice(&(header.nonce as u32).to_le_bytes());
    data
}

/// Encode a number as a Bitcoin varint
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffffffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

fn varint_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffffffff => 5,
        _ => 9,
    }
}
