//! Transaction memory pool
//!
//! ## Indexes
//!
//! - `entries`: txid -> entry, the primary index
//! - `by_fee_rate`: entries ordered by their own fee rate (eviction, selection)
//! - `spent_by`: outpoint -> txid of the entry spending it (conflicts)
//! - parent/child links inside each entry, for in-pool dependencies
//!
//! Every entry carries the count, size and fees of its ancestor set and its
//! descendant set, itself included in both. They are maintained on every
//! insert and removal; [`TxMempool::check_consistency`] recomputes them.

use crate::config::MempoolConfig;
use crate::constants::*;
use crate::error::ConsensusError;
use crate::hashing::{encode_varint, hash_to_hex, transaction_size, txid};
use crate::script::{is_null_data, is_push_only, is_standard_script, is_unspendable, SignaturePolicy};
use crate::transaction::{check_transaction, check_tx_inputs, is_coinbase, is_final, signals_rbf, MaturityPolicy};
use crate::types::*;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace};

/// Base units per 1000 serialized bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn from_fee(fee: Integer, size: usize) -> Self {
        if size == 0 || fee <= 0 {
            return FeeRate(0);
        }
        FeeRate((fee as u64).saturating_mul(1000) / size as u64)
    }

    /// Fee this rate asks for `size` bytes
    pub fn fee_for(&self, size: usize) -> Integer {
        (self.0.saturating_mul(size as u64) / 1000) as Integer
    }
}

/// Transaction rejected by mempool policy or by the consensus checks run on
/// admission. Never grounds for penalizing the relaying peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    AlreadyInMempool,

    #[error("coinbase transactions are only valid in blocks")]
    Coinbase,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("transaction size {size} exceeds standard limit {limit}")]
    TxSize { size: usize, limit: usize },

    #[error("non-standard transaction: {0}")]
    NonStandard(&'static str),

    #[error("transaction is not final")]
    NonFinal,

    #[error("input spends an output already spent by mempool transaction {0}")]
    Conflict(String),

    #[error("replacement rejected: {reason}")]
    Replacement { code: &'static str, reason: String },

    #[error("fee {fee} below minimum relay fee {required}")]
    MinRelayFee { fee: Integer, required: Integer },

    #[error("output {index} is dust ({value} < {threshold})")]
    Dust { index: usize, value: Integer, threshold: Integer },

    #[error("too long mempool chain: {0}")]
    TooLongChain(String),

    #[error("mempool is full")]
    Full,
}

impl MempoolError {
    pub fn code(&self) -> &'static str {
        match self {
            MempoolError::AlreadyInMempool => "txn-already-in-mempool",
            MempoolError::Coinbase => "coinbase",
            MempoolError::Consensus(err) => err.code(),
            MempoolError::TxSize { .. } => "tx-size",
            MempoolError::NonStandard(code) => code,
            MempoolError::NonFinal => "non-final",
            MempoolError::Conflict(_) => "txn-mempool-conflict",
            MempoolError::Replacement { code, .. } => code,
            MempoolError::MinRelayFee { .. } => "min relay fee not met",
            MempoolError::Dust { .. } => "dust",
            MempoolError::TooLongChain(_) => "too-long-mempool-chain",
            MempoolError::Full => "mempool full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash,
    pub fee: Integer,
    pub size: usize,
    pub fee_rate: FeeRate,
    /// Clock time at admission.
    pub time: u64,
    /// Chain height when admitted.
    pub entry_height: Natural,
    /// Lowest height of a confirmed coinbase output this transaction spends.
    pub spends_coinbase_height: Option<Natural>,
    pub signals_rbf: bool,
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub ancestor_fees: Integer,
    pub descendant_count: u64,
    pub descendant_size: u64,
    pub descendant_fees: Integer,
    parents: HashSet<Hash>,
    children: HashSet<Hash>,
    sequence: u64,
}

impl MempoolEntry {
    /// In-pool transactions this one spends from
    pub fn parents(&self) -> &HashSet<Hash> {
        &self.parents
    }

    pub fn children(&self) -> &HashSet<Hash> {
        &self.children
    }

    fn key(&self) -> FeeRateKey {
        FeeRateKey { fee_rate: self.fee_rate, sequence: Reverse(self.sequence), txid: self.txid }
    }
}

/// Ascending by fee rate; among equal rates the newest entry sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeRateKey {
    fee_rate: FeeRate,
    sequence: Reverse<u64>,
    txid: Hash,
}

impl Ord for FeeRateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee_rate
            .cmp(&other.fee_rate)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for FeeRateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Chain state an admission is checked against, taken under the chain lock.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    /// Confirmed coins for the transaction's prevouts (missing = spent or unknown).
    pub chain_coins: &'a UtxoSet,
    /// Height of the next block.
    pub spend_height: Natural,
    pub median_time_past: Natural,
    pub now: u64,
    pub maturity: MaturityPolicy,
    pub signature: SignaturePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolAccept {
    pub txid: Hash,
    pub fee: Integer,
    /// Entries evicted by replace-by-fee.
    pub replaced: Vec<Transaction>,
}

#[derive(Debug)]
pub struct TxMempool {
    config: MempoolConfig,
    entries: HashMap<Hash, MempoolEntry>,
    by_fee_rate: BTreeSet<FeeRateKey>,
    spent_by: HashMap<OutPoint, Hash>,
    total_size: usize,
    next_sequence: u64,
}

impl TxMempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            spent_by: HashMap::new(),
            total_size: 0,
            next_sequence: 0,
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the serialized sizes of all entries
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.spent_by.get(outpoint)
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }

    /// Outpoints spent by entries that are not themselves in the pool,
    /// i.e. the confirmed coins the pool depends on.
    pub fn chain_prevouts(&self) -> Vec<OutPoint> {
        self.spent_by
            .keys()
            .filter(|outpoint| !self.entries.contains_key(&outpoint.hash))
            .cloned()
            .collect()
    }

    // ============================================================================
    // ADMISSION
    // ============================================================================

    /// Context-free policy checks, safe to run before taking any lock.
    pub fn check_standalone(&self, tx: &Transaction) -> Result<(), MempoolError> {
        check_transaction(tx)?;
        if is_coinbase(tx) {
            return Err(MempoolError::Coinbase);
        }
        let size = transaction_size(tx);
        if size > self.config.max_standard_tx_size {
            return Err(MempoolError::TxSize { size, limit: self.config.max_standard_tx_size });
        }
        if self.config.require_standard {
            if tx.inputs.iter().any(|input| !is_push_only(&input.script_sig)) {
                return Err(MempoolError::NonStandard("scriptsig-not-pushonly"));
            }
            if tx.outputs.iter().any(|output| !is_standard_script(&output.script_pubkey)) {
                return Err(MempoolError::NonStandard("scriptpubkey"));
            }
        }
        Ok(())
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × 𝒰𝒮 → {accepted, rejected}
    ///
    /// For transaction tx against confirmed coins us and the pool:
    /// 1. Structure, standardness and finality
    /// 2. Conflicts with pool entries (replaceable only under replace-by-fee)
    /// 3. Resolve inputs from us plus in-pool parents; fee rate and dust
    /// 4. Ancestor and descendant limits
    /// 5. Consensus input checks and scripts
    /// 6. Insert, evict replaced entries, trim to the size limit
    ///
    /// Nothing changes unless the transaction is accepted.
    pub fn accept_to_memory_pool(
        &mut self,
        tx: Transaction,
        ctx: &AdmissionContext<'_>,
    ) -> Result<MempoolAccept, MempoolError> {
        let id = txid(&tx);
        if self.entries.contains_key(&id) {
            return Err(MempoolError::AlreadyInMempool);
        }

        // 1. structure
        self.check_standalone(&tx)?;
        if !is_final(&tx, ctx.spend_height, ctx.median_time_past) {
            return Err(MempoolError::NonFinal);
        }

        // 2. conflicts
        let conflicts: BTreeSet<Hash> =
            tx.inputs.iter().filter_map(|input| self.spent_by.get(&input.prevout).copied()).collect();
        if !conflicts.is_empty() {
            if !self.config.replace_by_fee {
                let first = conflicts.iter().next().map(hash_to_hex).unwrap_or_default();
                return Err(MempoolError::Conflict(first));
            }
            if let Some(unreplaceable) = conflicts.iter().find(|conflict| !self.entries[*conflict].signals_rbf) {
                return Err(MempoolError::Conflict(hash_to_hex(unreplaceable)));
            }
        }

        // 3. inputs, fee rate, dust
        let (view, parents) = self.resolve_inputs(&tx, ctx.chain_coins);
        let fee = check_tx_inputs(&tx, &view, ctx.spend_height, ctx.maturity)?;
        let size = transaction_size(&tx);
        if !is_fee_exempt(&tx) {
            let required = FeeRate(self.config.min_relay_fee_rate).fee_for(size);
            if fee < required {
                return Err(MempoolError::MinRelayFee { fee, required });
            }
            let dust_rate = FeeRate(self.config.dust_relay_fee_rate);
            for (index, output) in tx.outputs.iter().enumerate() {
                let threshold = dust_threshold(output, dust_rate);
                if output.value < threshold {
                    return Err(MempoolError::Dust { index, value: output.value, threshold });
                }
            }
        }

        let replaced = if conflicts.is_empty() {
            Vec::new()
        } else {
            self.check_replacement(&tx, fee, size, &conflicts, &parents)?
        };

        // 4. package limits
        let ancestors = self.ancestors_of(&parents);
        self.check_chain_limits(&ancestors, size)?;

        // 5. scripts
        for (input_index, input) in tx.inputs.iter().enumerate() {
            if let Some(coin) = view.get(&input.prevout) {
                ctx.signature.verify_input(&tx, input_index, coin).map_err(|err| {
                    debug!(input = input_index, %err, "mempool script check failed");
                    ConsensusError::ScriptVerifyFailed { txid: hash_to_hex(&id), input: input_index }
                })?;
            }
        }

        // 6. commit
        let replaced_txs = self.remove_set(&replaced);
        let spends_coinbase_height = tx
            .inputs
            .iter()
            .filter_map(|input| view.get(&input.prevout))
            .filter(|coin| coin.is_coinbase)
            .map(|coin| coin.height)
            .min();

        let entry = MempoolEntry {
            signals_rbf: signals_rbf(&tx),
            tx,
            txid: id,
            fee,
            size,
            fee_rate: FeeRate::from_fee(fee, size),
            time: ctx.now,
            entry_height: ctx.spend_height.saturating_sub(1),
            spends_coinbase_height,
            ancestor_count: 1,
            ancestor_size: size as u64,
            ancestor_fees: fee,
            descendant_count: 1,
            descendant_size: size as u64,
            descendant_fees: fee,
            parents,
            children: HashSet::new(),
            sequence: 0,
        };
        self.insert(entry);

        self.trim_to_size();
        if !self.entries.contains_key(&id) {
            return Err(MempoolError::Full);
        }

        debug!(txid = %hash_to_hex(&id), fee, size, replaced = replaced_txs.len(), "accepted to mempool");
        Ok(MempoolAccept { txid: id, fee, replaced: replaced_txs })
    }

    /// Coins the transaction spends, from the chain or from pool parents,
    /// and the set of those parents.
    fn resolve_inputs(&self, tx: &Transaction, chain_coins: &UtxoSet) -> (UtxoSet, HashSet<Hash>) {
        let mut view = UtxoSet::new();
        let mut parents = HashSet::new();
        for input in &tx.inputs {
            let prevout = &input.prevout;
            if let Some(parent) = self.entries.get(&prevout.hash) {
                if let Some(output) = parent.tx.outputs.get(prevout.index as usize) {
                    parents.insert(parent.txid);
                    view.insert(
                        prevout.clone(),
                        Coin {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height: parent.entry_height + 1,
                            is_coinbase: false,
                        },
                    );
                }
            } else if let Some(coin) = chain_coins.get(prevout) {
                view.insert(prevout.clone(), coin.clone());
            }
        }
        (view, parents)
    }

    /// Replace-by-fee checks; returns every entry the transaction evicts.
    ///
    /// 1. At most MAX_REPLACEMENT_CANDIDATES entries are evicted
    /// 2. The transaction does not spend from anything it evicts
    /// 3. No unconfirmed input that the replaced entries did not already have
    /// 4. Fee rate above every directly conflicting entry
    /// 5. Absolute fee covers the evicted fees plus relay of its own size
    fn check_replacement(
        &self,
        tx: &Transaction,
        fee: Integer,
        size: usize,
        conflicts: &BTreeSet<Hash>,
        parents: &HashSet<Hash>,
    ) -> Result<Vec<Hash>, MempoolError> {
        let mut evicted: HashSet<Hash> = HashSet::new();
        for conflict in conflicts {
            evicted.insert(*conflict);
            evicted.extend(self.descendants(conflict));
        }
        if evicted.len() > MAX_REPLACEMENT_CANDIDATES {
            return Err(MempoolError::Replacement {
                code: "too many potential replacements",
                reason: format!("would evict {} entries", evicted.len()),
            });
        }

        if let Some(parent) = parents.iter().find(|parent| evicted.contains(*parent)) {
            return Err(MempoolError::Replacement {
                code: "bad-txns-spends-conflicting-tx",
                reason: format!("spends from replaced transaction {}", hash_to_hex(parent)),
            });
        }

        let known_parents: HashSet<Hash> =
            conflicts.iter().flat_map(|conflict| self.entries[conflict].parents.iter().copied()).collect();
        if parents.iter().any(|parent| !known_parents.contains(parent)) {
            return Err(MempoolError::Replacement {
                code: "replacement-adds-unconfirmed",
                reason: "replacement spends a new unconfirmed output".to_string(),
            });
        }

        let fee_rate = FeeRate::from_fee(fee, size);
        for conflict in conflicts {
            let existing = &self.entries[conflict];
            if fee_rate <= existing.fee_rate {
                return Err(MempoolError::Replacement {
                    code: "insufficient fee",
                    reason: format!("fee rate {} does not beat {}", fee_rate.0, existing.fee_rate.0),
                });
            }
        }

        let evicted_fees: Integer = evicted.iter().map(|hash| self.entries[hash].fee).sum();
        let relay = FeeRate(self.config.min_relay_fee_rate).fee_for(size);
        if fee < evicted_fees + relay {
            return Err(MempoolError::Replacement {
                code: "insufficient fee",
                reason: format!("fee {fee} does not cover replaced fees {evicted_fees} plus relay {relay}"),
            });
        }

        trace!(count = evicted.len(), "replacement accepted");
        Ok(evicted.into_iter().collect())
    }

    fn check_chain_limits(&self, ancestors: &HashSet<Hash>, size: usize) -> Result<(), MempoolError> {
        let count = ancestors.len() as u64 + 1;
        let ancestor_size: u64 = ancestors.iter().map(|hash| self.entries[hash].size as u64).sum::<u64>() + size as u64;
        if count > self.config.ancestor_limit {
            return Err(MempoolError::TooLongChain(format!(
                "too many unconfirmed ancestors [limit: {}]",
                self.config.ancestor_limit
            )));
        }
        if ancestor_size > self.config.ancestor_size_limit {
            return Err(MempoolError::TooLongChain(format!(
                "exceeds ancestor size limit [limit: {}]",
                self.config.ancestor_size_limit
            )));
        }

        for ancestor in ancestors {
            let entry = &self.entries[ancestor];
            if entry.descendant_count + 1 > self.config.descendant_limit {
                return Err(MempoolError::TooLongChain(format!(
                    "too many descendants for {} [limit: {}]",
                    hash_to_hex(ancestor),
                    self.config.descendant_limit
                )));
            }
            if entry.descendant_size + size as u64 > self.config.descendant_size_limit {
                return Err(MempoolError::TooLongChain(format!(
                    "exceeds descendant size limit for {} [limit: {}]",
                    hash_to_hex(ancestor),
                    self.config.descendant_size_limit
                )));
            }
        }
        Ok(())
    }

    // ============================================================================
    // INDEX MAINTENANCE
    // ============================================================================

    /// Link a checked entry into every index and update the aggregates of its
    /// ancestors. The entry has no children yet.
    fn insert(&mut self, mut entry: MempoolEntry) {
        let id = entry.txid;
        let ancestors = self.ancestors_of(&entry.parents);
        let size = entry.size as u64;
        let fee = entry.fee;

        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        entry.ancestor_count = 1 + ancestors.len() as u64;
        entry.ancestor_size = size;
        entry.ancestor_fees = fee;
        for ancestor in &ancestors {
            let parent = &self.entries[ancestor];
            entry.ancestor_size += parent.size as u64;
            entry.ancestor_fees += parent.fee;
        }

        for ancestor in &ancestors {
            if let Some(parent) = self.entries.get_mut(ancestor) {
                parent.descendant_count += 1;
                parent.descendant_size += size;
                parent.descendant_fees += fee;
            }
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(id);
            }
        }
        for input in &entry.tx.inputs {
            self.spent_by.insert(input.prevout.clone(), id);
        }

        self.total_size += entry.size;
        self.by_fee_rate.insert(entry.key());
        self.entries.insert(id, entry);
    }

    /// Transitive in-pool ancestors of a transaction with direct `parents`
    fn ancestors_of(&self, parents: &HashSet<Hash>) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Hash> = parents.iter().copied().collect();
        while let Some(hash) = stack.pop() {
            if let Some(entry) = self.entries.get(&hash) {
                if seen.insert(hash) {
                    stack.extend(entry.parents.iter().copied());
                }
            }
        }
        seen
    }

    /// Transitive in-pool descendants, excluding `txid` itself
    fn descendants(&self, txid: &Hash) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Hash> = self.entries.get(txid).map(|entry| entry.children.iter().copied().collect()).unwrap_or_default();
        while let Some(hash) = stack.pop() {
            if let Some(entry) = self.entries.get(&hash) {
                if seen.insert(hash) {
                    stack.extend(entry.children.iter().copied());
                }
            }
        }
        seen
    }

    /// Remove one entry, re-scoring everything related to it.
    fn remove_entry(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let (parents, size, fee) = {
            let entry = self.entries.get(txid)?;
            (entry.parents.clone(), entry.size as u64, entry.fee)
        };
        let ancestors = self.ancestors_of(&parents);
        let descendants = self.descendants(txid);

        for ancestor in &ancestors {
            if let Some(entry) = self.entries.get_mut(ancestor) {
                entry.descendant_count -= 1;
                entry.descendant_size -= size;
                entry.descendant_fees -= fee;
            }
        }
        for descendant in &descendants {
            if let Some(entry) = self.entries.get_mut(descendant) {
                entry.ancestor_count -= 1;
                entry.ancestor_size -= size;
                entry.ancestor_fees -= fee;
            }
        }

        let entry = self.entries.remove(txid)?;
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.remove(txid);
            }
        }
        for input in &entry.tx.inputs {
            if self.spent_by.get(&input.prevout) == Some(txid) {
                self.spent_by.remove(&input.prevout);
            }
        }
        self.by_fee_rate.remove(&entry.key());
        self.total_size -= entry.size;

        // a middle entry leaving separates survivors on both sides
        if !ancestors.is_empty() && !descendants.is_empty() {
            for hash in ancestors.iter().chain(&descendants) {
                self.recompute_aggregates(hash);
            }
        }
        Some(entry)
    }

    /// Remove a set closed under descendants, leaves first.
    fn remove_set(&mut self, txids: &[Hash]) -> Vec<Transaction> {
        let mut ordered: Vec<(u64, Hash)> = txids
            .iter()
            .filter_map(|hash| self.entries.get(hash).map(|entry| (entry.ancestor_count, *hash)))
            .collect();
        ordered.sort_by(|a, b| b.cmp(a));
        ordered
            .into_iter()
            .filter_map(|(_, hash)| self.remove_entry(&hash))
            .map(|entry| entry.tx)
            .collect()
    }

    /// Remove `txid` and everything that spends from it.
    pub fn remove_with_descendants(&mut self, txid: &Hash) -> Vec<Transaction> {
        if !self.entries.contains_key(txid) {
            return Vec::new();
        }
        let mut set: Vec<Hash> = self.descendants(txid).into_iter().collect();
        set.push(*txid);
        self.remove_set(&set)
    }

    fn aggregates_from_scratch(&self, txid: &Hash) -> Option<(u64, u64, Integer, u64, u64, Integer)> {
        let entry = self.entries.get(txid)?;
        let ancestors = self.ancestors_of(&entry.parents);
        let descendants = self.descendants(txid);
        let sum = |set: &HashSet<Hash>| {
            set.iter().fold((1u64, entry.size as u64, entry.fee), |(count, size, fees), hash| {
                let other = &self.entries[hash];
                (count + 1, size + other.size as u64, fees + other.fee)
            })
        };
        let (ancestor_count, ancestor_size, ancestor_fees) = sum(&ancestors);
        let (descendant_count, descendant_size, descendant_fees) = sum(&descendants);
        Some((ancestor_count, ancestor_size, ancestor_fees, descendant_count, descendant_size, descendant_fees))
    }

    fn recompute_aggregates(&mut self, txid: &Hash) {
        if let Some(aggregates) = self.aggregates_from_scratch(txid) {
            if let Some(entry) = self.entries.get_mut(txid) {
                (
                    entry.ancestor_count,
                    entry.ancestor_size,
                    entry.ancestor_fees,
                    entry.descendant_count,
                    entry.descendant_size,
                    entry.descendant_fees,
                ) = aggregates;
            }
        }
    }

    // ============================================================================
    // CHAIN UPDATES
    // ============================================================================

    /// A block was connected: drop its transactions and anything conflicting
    /// with them. Returns the conflicting transactions that were evicted.
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Transaction> {
        let mut evicted = Vec::new();
        for tx in &block.transactions {
            let id = txid(tx);
            if self.remove_entry(&id).is_some() {
                trace!(txid = %hash_to_hex(&id), "confirmed");
            }
            if is_coinbase(tx) {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spent_by.get(&input.prevout).copied() {
                    evicted.extend(self.remove_with_descendants(&conflict));
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted conflicts with connected block");
        }
        evicted
    }

    /// Drop entries older than the configured expiry.
    pub fn expire(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.config.expiry_secs);
        let stale: Vec<Hash> =
            self.entries.values().filter(|entry| entry.time < cutoff).map(|entry| entry.txid).collect();
        let mut removed = 0;
        for txid in stale {
            removed += self.remove_with_descendants(&txid).len();
        }
        removed
    }

    /// After a reorg: drop entries whose confirmed inputs vanished or whose
    /// coinbase inputs are no longer mature at `spend_height`.
    pub fn remove_for_reorg(&mut self, chain_coins: &UtxoSet, spend_height: Natural, maturity: MaturityPolicy) -> Vec<Transaction> {
        let broken: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| {
                entry.tx.inputs.iter().any(|input| {
                    if self.entries.contains_key(&input.prevout.hash) {
                        return false;
                    }
                    match chain_coins.get(&input.prevout) {
                        Some(coin) => maturity.check(coin, spend_height).is_err(),
                        None => true,
                    }
                })
            })
            .map(|entry| entry.txid)
            .collect();

        let mut removed = Vec::new();
        for txid in broken {
            removed.extend(self.remove_with_descendants(&txid));
        }
        removed
    }

    /// Evict the lowest fee-rate entries (with descendants) until the pool
    /// fits `max_size_bytes`.
    pub fn trim_to_size(&mut self) -> usize {
        let mut removed = 0;
        while self.total_size > self.config.max_size_bytes {
            let lowest = match self.by_fee_rate.iter().next() {
                Some(key) => key.txid,
                None => break,
            };
            removed += self.remove_with_descendants(&lowest).len();
        }
        removed
    }

    /// Transactions for a block template, by fee rate, each preceded by its
    /// unselected ancestors, within `max_bytes`.
    pub fn select_for_block(&self, max_bytes: usize) -> Vec<Transaction> {
        let mut selected: HashSet<Hash> = HashSet::new();
        let mut ordered = Vec::new();
        let mut used = 0usize;

        for key in self.by_fee_rate.iter().rev() {
            if selected.contains(&key.txid) {
                continue;
            }
            let entry = &self.entries[&key.txid];
            let mut package: Vec<&MempoolEntry> = self
                .ancestors_of(&entry.parents)
                .iter()
                .filter(|hash| !selected.contains(*hash))
                .map(|hash| &self.entries[hash])
                .collect();
            package.push(entry);
            package.sort_by_key(|member| (member.ancestor_count, member.sequence));

            let package_size: usize = package.iter().map(|member| member.size).sum();
            if used + package_size > max_bytes {
                continue;
            }
            used += package_size;
            for member in package {
                selected.insert(member.txid);
                ordered.push(member.tx.clone());
            }
        }
        ordered
    }

    // ============================================================================
    // CONSISTENCY
    // ============================================================================

    /// Recompute every index and aggregate from scratch and compare.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut total_size = 0;
        for (hash, entry) in &self.entries {
            total_size += entry.size;
            let expected = self
                .aggregates_from_scratch(hash)
                .ok_or_else(|| format!("{} vanished", hash_to_hex(hash)))?;
            let actual = (
                entry.ancestor_count,
                entry.ancestor_size,
                entry.ancestor_fees,
                entry.descendant_count,
                entry.descendant_size,
                entry.descendant_fees,
            );
            if expected != actual {
                return Err(format!("{} aggregates {actual:?}, expected {expected:?}", hash_to_hex(hash)));
            }
            if entry.descendant_count < 1 || entry.ancestor_count < 1 {
                return Err(format!("{} does not count itself", hash_to_hex(hash)));
            }

            let parents: HashSet<Hash> = entry
                .tx
                .inputs
                .iter()
                .map(|input| input.prevout.hash)
                .filter(|parent| self.entries.contains_key(parent))
                .collect();
            if parents != entry.parents {
                return Err(format!("{} has stale parent links", hash_to_hex(hash)));
            }
            for child in &entry.children {
                if !self.entries.get(child).map_or(false, |child| child.parents.contains(hash)) {
                    return Err(format!("{} has a dangling child link", hash_to_hex(hash)));
                }
            }
            for input in &entry.tx.inputs {
                if self.spent_by.get(&input.prevout) != Some(hash) {
                    return Err(format!("{} input not indexed as spent", hash_to_hex(hash)));
                }
            }
        }

        if total_size != self.total_size {
            return Err(format!("total size {} but entries sum to {total_size}", self.total_size));
        }
        if self.by_fee_rate.len() != self.entries.len() {
            return Err("fee rate index out of sync".to_string());
        }
        if self.spent_by.values().any(|spender| !self.entries.contains_key(spender)) {
            return Err("spent index refers to a removed entry".to_string());
        }
        Ok(())
    }
}

/// Data-carrier-only transactions pay no relay fee and have no dust.
pub fn is_fee_exempt(tx: &Transaction) -> bool {
    !tx.outputs.is_empty() && tx.outputs.iter().all(|output| is_null_data(&output.script_pubkey))
}

/// Value below which spending an output costs more than it is worth:
/// (serialized output size + 148 byte spending input) at the dust rate.
/// Unspendable outputs are never dust.
pub fn dust_threshold(output: &TransactionOutput, dust_rate: FeeRate) -> Integer {
    if is_unspendable(&output.script_pubkey) {
        return 0;
    }
    let size = 8 + encode_varint(output.script_pubkey.len() as u64).len() + output.script_pubkey.len();
    dust_rate.fee_for(size + 148)
}
