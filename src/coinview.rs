//! Write-back coin cache over a [`CoinStore`]
//!
//! Reads fill the cache; block connects and disconnects change the cache
//! only. Dirty entries reach the store in a single batch on `flush`, together
//! with pending undo records and the new tip.

use crate::config::CoinCacheConfig;
use crate::error::{Error, Result};
use crate::hashing::hash_to_hex;
use crate::storage::{CoinBatch, CoinStore};
use crate::types::*;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry that differs from the store; never evicted before a flush.
#[derive(Debug, Clone)]
struct DirtyEntry {
    /// `None`: spent.
    coin: Option<Coin>,
    /// Created since the last flush, so the store has never seen it.
    fresh: bool,
}

pub struct CachedCoinView {
    store: Arc<dyn CoinStore>,
    /// Mirrors the store; `None` caches a miss.
    clean: LruCache<OutPoint, Option<Coin>>,
    dirty: HashMap<OutPoint, DirtyEntry>,
    pending_undo: HashMap<Hash, UndoSet>,
    pending_discard: HashSet<Hash>,
    tip: Hash,
    tip_height: Natural,
    tip_dirty: bool,
    config: CoinCacheConfig,
    max_reorg_depth: Natural,
    undo_horizon: Natural,
}

impl CachedCoinView {
    /// Open the view on `store`, whose coin set must correspond to `genesis`
    /// or be empty.
    pub fn new(
        store: Arc<dyn CoinStore>,
        genesis: Hash,
        config: CoinCacheConfig,
        max_reorg_depth: Natural,
    ) -> Result<Self> {
        if let Some(stored_tip) = store.tip()? {
            if stored_tip != genesis {
                return Err(Error::InconsistentState(format!(
                    "coin store is at {} but the chain index starts from genesis",
                    hash_to_hex(&stored_tip)
                )));
            }
        }

        Ok(Self {
            store,
            clean: LruCache::unbounded(),
            dirty: HashMap::new(),
            pending_undo: HashMap::new(),
            pending_discard: HashSet::new(),
            tip: genesis,
            tip_height: 0,
            tip_dirty: false,
            config,
            max_reorg_depth,
            undo_horizon: 0,
        })
    }

    /// Block the cached coin set corresponds to
    pub fn tip(&self) -> Hash {
        self.tip
    }

    pub fn tip_height(&self) -> Natural {
        self.tip_height
    }

    pub fn len(&self) -> usize {
        self.clean.len() + self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Lowest height whose undo record is guaranteed to exist. Never
    /// decreases, even when the tip moves down.
    pub fn undo_horizon(&self) -> Natural {
        self.undo_horizon
    }

    fn load(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        if let Some(entry) = self.dirty.get(outpoint) {
            return Ok(entry.coin.clone());
        }
        if let Some(coin) = self.clean.get(outpoint) {
            return Ok(coin.clone());
        }

        let coin = self.store.get(outpoint)?;
        self.clean.put(outpoint.clone(), coin.clone());
        Ok(coin)
    }

    /// Resolve outpoints; `None` marks a coin that does not exist or is spent.
    pub fn fetch_coins(&mut self, outpoints: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>> {
        let coins = self.load_all(outpoints)?;
        self.evict();
        Ok(coins)
    }

    fn load_all(&mut self, outpoints: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>> {
        let mut coins = HashMap::with_capacity(outpoints.len());
        for outpoint in outpoints {
            let coin = self.load(outpoint)?;
            coins.insert(outpoint.clone(), coin);
        }
        Ok(coins)
    }

    /// Unspent coins among `outpoints`, as a plain set.
    pub fn fetch_utxos(&mut self, outpoints: &[OutPoint]) -> Result<UtxoSet> {
        Ok(self
            .fetch_coins(outpoints)?
            .into_iter()
            .filter_map(|(outpoint, coin)| coin.map(|coin| (outpoint, coin)))
            .collect())
    }

    /// Apply the coin effects of one block and move the tip.
    ///
    /// Every spent coin must exist and every created coin must not; this is
    /// checked before anything changes, so a rejected call leaves the view
    /// untouched.
    pub fn save_changes(&mut self, changes: CoinChanges, new_tip: Hash, new_tip_height: Natural) -> Result<()> {
        let mut lookups: Vec<OutPoint> = changes.spent.clone();
        lookups.extend(changes.created.iter().map(|(outpoint, _)| outpoint.clone()));
        // no eviction between verification and application
        let current = self.load_all(&lookups)?;

        let mut seen = HashSet::with_capacity(changes.spent.len());
        for outpoint in &changes.spent {
            if !seen.insert(outpoint) || current.get(outpoint).map_or(true, Option::is_none) {
                return Err(Error::InconsistentState(format!(
                    "spent coin {}:{} is not in the coin set",
                    hash_to_hex(&outpoint.hash),
                    outpoint.index
                )));
            }
        }
        for (outpoint, _) in &changes.created {
            if current.get(outpoint).map_or(false, Option::is_some) {
                return Err(Error::InconsistentState(format!(
                    "created coin {}:{} already exists",
                    hash_to_hex(&outpoint.hash),
                    outpoint.index
                )));
            }
        }

        for outpoint in changes.spent {
            self.clean.pop(&outpoint);
            match self.dirty.get(&outpoint) {
                Some(entry) if entry.fresh => {
                    self.dirty.remove(&outpoint);
                }
                _ => {
                    self.dirty.insert(outpoint, DirtyEntry { coin: None, fresh: false });
                }
            }
        }

        for (outpoint, coin) in changes.created {
            // a cached miss means the store has no coin here either
            let fresh = self.clean.pop(&outpoint).is_some();
            self.dirty.insert(outpoint, DirtyEntry { coin: Some(coin), fresh });
        }

        match changes.undo {
            UndoUpdate::Record { block, undo } => {
                self.pending_discard.remove(&block);
                self.pending_undo.insert(block, undo);
            }
            UndoUpdate::Discard { block } => {
                self.pending_undo.remove(&block);
                self.pending_discard.insert(block);
            }
        }

        self.tip = new_tip;
        self.tip_height = new_tip_height;
        self.tip_dirty = true;

        if self.dirty.len() >= self.config.flush_threshold {
            debug!(dirty = self.dirty.len(), "coin cache reached flush threshold");
            self.flush()?;
        }
        self.evict();
        Ok(())
    }

    /// Undo record of a connected block
    pub fn get_undo_data(&self, block: &Hash) -> Result<Option<UndoSet>> {
        if let Some(undo) = self.pending_undo.get(block) {
            return Ok(Some(undo.clone()));
        }
        if self.pending_discard.contains(block) {
            return Ok(None);
        }
        Ok(self.store.get_undo(block)?)
    }

    /// Undo records below this height may be dropped at the next flush.
    ///
    /// Two reorg windows behind the tip: one switch may lower the tip by up
    /// to `max_reorg_depth`, and the next must still find its records.
    fn undo_cutoff(&self) -> Natural {
        self.tip_height.saturating_sub(self.max_reorg_depth.saturating_mul(2))
    }

    /// Write every pending change to the store in one batch.
    ///
    /// On failure nothing is cleared, so a later flush retries the same data.
    pub fn flush(&mut self) -> Result<()> {
        let coins: Vec<(OutPoint, Option<Coin>)> =
            self.dirty.iter().map(|(outpoint, entry)| (outpoint.clone(), entry.coin.clone())).collect();
        let cutoff = self.tip_dirty.then(|| self.undo_cutoff().max(self.undo_horizon));

        let batch = CoinBatch {
            coins,
            undo_put: self.pending_undo.iter().map(|(hash, undo)| (*hash, undo.clone())).collect(),
            undo_delete: self.pending_discard.iter().copied().collect(),
            tip: self.tip_dirty.then_some(self.tip),
            prune_undo_below: cutoff,
        };
        if batch.is_empty() {
            return Ok(());
        }

        let written = batch.coins.len();
        if let Err(err) = self.store.batch_write(batch) {
            warn!(%err, "coin cache flush failed");
            return Err(err.into());
        }

        for (outpoint, entry) in self.dirty.drain() {
            if let Some(coin) = entry.coin {
                self.clean.put(outpoint, Some(coin));
            }
        }
        self.pending_undo.clear();
        self.pending_discard.clear();
        self.tip_dirty = false;
        if let Some(cutoff) = cutoff {
            self.undo_horizon = cutoff;
        }
        self.evict();

        debug!(coins = written, tip_height = self.tip_height, undo_horizon = self.undo_horizon, "coin cache flushed");
        Ok(())
    }

    /// Drop least recently used clean entries above the size bound.
    fn evict(&mut self) {
        while self.len() > self.config.max_items {
            if self.clean.pop_lru().is_none() {
                break;
            }
        }
    }
}
