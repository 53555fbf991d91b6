//! Persistence contracts for coins, undo data and block bodies
//!
//! The consensus core only needs keyed reads and atomic batch writes; the
//! encoding on disk belongs to whoever implements these traits. In-memory
//! implementations are provided for tests and embedding.

use crate::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// One atomic write to a [`CoinStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinBatch {
    /// `None` deletes the coin.
    pub coins: Vec<(OutPoint, Option<Coin>)>,
    pub undo_put: Vec<(Hash, UndoSet)>,
    pub undo_delete: Vec<Hash>,
    pub tip: Option<Hash>,
    /// Undo records for blocks below this height are no longer needed.
    pub prune_undo_below: Option<Natural>,
}

impl CoinBatch {
    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
            && self.undo_put.is_empty()
            && self.undo_delete.is_empty()
            && self.tip.is_none()
            && self.prune_undo_below.is_none()
    }
}

/// Backing store of the coin set.
pub trait CoinStore: Send + Sync {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError>;

    /// Apply the whole batch or nothing.
    fn batch_write(&self, batch: CoinBatch) -> Result<(), StorageError>;

    fn get_undo(&self, block: &Hash) -> Result<Option<UndoSet>, StorageError>;

    /// Block the stored coin set corresponds to.
    fn tip(&self) -> Result<Option<Hash>, StorageError>;
}

/// Backing store of block bodies.
pub trait BlockStore: Send + Sync {
    fn get(&self, hash: &Hash) -> Result<Option<Arc<Block>>, StorageError>;
    fn put(&self, hash: Hash, block: Arc<Block>) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct CoinState {
    coins: UtxoSet,
    undo: HashMap<Hash, UndoSet>,
    tip: Option<Hash>,
}

/// In-memory [`CoinStore`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryCoinStore {
    state: RwLock<CoinState>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    batches: AtomicUsize,
}

impl MemoryCoinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent batch writes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Copy of the stored coin set
    pub fn utxo_set(&self) -> UtxoSet {
        self.state.read().coins.clone()
    }

    pub fn undo_count(&self) -> usize {
        self.state.read().undo.len()
    }

    /// Number of batches committed
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

impl CoinStore for MemoryCoinStore {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        self.check_reads()?;
        Ok(self.state.read().coins.get(outpoint).cloned())
    }

    fn batch_write(&self, batch: CoinBatch) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }

        let mut state = self.state.write();
        for (outpoint, coin) in batch.coins {
            match coin {
                Some(coin) => {
                    state.coins.insert(outpoint, coin);
                }
                None => {
                    state.coins.remove(&outpoint);
                }
            }
        }
        for hash in batch.undo_delete {
            state.undo.remove(&hash);
        }
        for (hash, undo) in batch.undo_put {
            state.undo.insert(hash, undo);
        }
        if let Some(cutoff) = batch.prune_undo_below {
            state.undo.retain(|_, undo| undo.height >= cutoff);
        }
        if let Some(tip) = batch.tip {
            state.tip = Some(tip);
        }

        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_undo(&self, block: &Hash) -> Result<Option<UndoSet>, StorageError> {
        self.check_reads()?;
        Ok(self.state.read().undo.get(block).cloned())
    }

    fn tip(&self) -> Result<Option<Hash>, StorageError> {
        self.check_reads()?;
        Ok(self.state.read().tip)
    }
}

/// In-memory [`BlockStore`].
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash, Arc<Block>>>,
    fail_writes: AtomicBool,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, hash: &Hash) -> Result<Option<Arc<Block>>, StorageError> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    fn put(&self, hash: Hash, block: Arc<Block>) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }
        self.blocks.write().insert(hash, block);
        Ok(())
    }
}
