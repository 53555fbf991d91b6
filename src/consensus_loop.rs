//! The consensus loop: the one path that mutates chain state
//!
//! Headers, bodies and transactions from every peer end up here. The chain
//! index and the coin view sit behind a single lock, so header acceptance,
//! block connects, disconnects and reorganizations never interleave. The
//! mempool has its own lock, always taken after the chain lock.
//!
//! Relay callbacks are collected while the chain lock is held and issued
//! after it is released. Notifications are published under the lock, once a
//! chain switch has committed, so subscribers observe connects and
//! disconnects in the order they happened. Handlers must not call back into
//! the loop from the publishing thread.

use crate::block::{block_prevouts, connect_changes, disconnect_changes};
use crate::chain_index::{ChainIndex, ChainedHeader, ValidationState};
use crate::coinview::CachedCoinView;
use crate::constants::{MAX_PARKED_BODIES, MAX_PARKED_HEADERS};
use crate::context::ConsensusContext;
use crate::error::{ConsensusError, Error, Result, RuleError};
use crate::hashing::{block_hash, hash_to_hex, txid};
use crate::mempool::{AdmissionContext, MempoolAccept, MempoolError, TxMempool};
use crate::network::{InventoryItem, PeerId, PeerRelay, SubmitOutcome};
use crate::reorganization::{check_undo_horizon, plan_reorganization, should_reorganize, ReorgPlan};
use crate::rules::{RuleContext, RuleEngine};
use crate::signals::{BlockConnected, BlockDisconnected, Signals, TransactionReceived};
use crate::storage::{BlockStore, CoinStore};
use crate::transaction::is_coinbase;
use crate::types::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where a block stands in the acceptance pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Waiting behind a parent header that is itself deferred.
    HeaderSeen,
    HeaderValidated,
    BodyRequested,
    PartiallyValidated,
    FullyValidated,
    Invalid,
    /// Header rules could not decide yet.
    Deferred,
}

/// Header kept aside until [`ConsensusLoop::retry_deferred`].
#[derive(Debug, Clone)]
struct ParkedHeader {
    hash: Hash,
    header: BlockHeader,
    peer: Option<PeerId>,
    request_body: bool,
    behind_parent: bool,
}

/// Everything guarded by the chain lock.
struct ChainState {
    index: ChainIndex,
    coins: CachedCoinView,
    body_requested: HashSet<Hash>,
    parked: Vec<ParkedHeader>,
    parked_bodies: HashMap<Hash, (Arc<Block>, Option<PeerId>)>,
    /// Peer that supplied each header or body, for penalties found later.
    /// Dropped once the block connects, turns invalid or is pruned.
    sources: HashMap<Hash, PeerId>,
}

impl ChainState {
    /// Park a header, dropping the oldest one and its body when full.
    fn park_header(&mut self, parked: ParkedHeader) {
        if self.parked.len() >= MAX_PARKED_HEADERS {
            let dropped = self.parked.remove(0);
            self.parked_bodies.remove(&dropped.hash);
            debug!(hash = %hash_to_hex(&dropped.hash), "parked header limit reached, dropping the oldest");
        }
        self.parked.push(parked);
    }

    fn park_body(&mut self, hash: Hash, block: Arc<Block>, peer: Option<PeerId>) {
        if self.parked_bodies.len() >= MAX_PARKED_BODIES && !self.parked_bodies.contains_key(&hash) {
            debug!(hash = %hash_to_hex(&hash), "parked body limit reached, body dropped");
            return;
        }
        self.parked_bodies.insert(hash, (block, peer));
    }

    /// Drop bookkeeping for headers that turned invalid or left the index.
    fn forget(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.sources.remove(hash);
            self.body_requested.remove(hash);
            self.parked_bodies.remove(hash);
        }
    }
}

/// Relay callback deferred until the chain lock is released.
#[derive(Debug)]
enum RelayAction {
    RequestBody(Hash, Option<PeerId>),
    Inventory(InventoryItem),
    Misbehaving(PeerId, u32, String),
}

struct DisconnectedBlock {
    entry: ChainedHeaderBlock,
    undo: UndoSet,
}

/// A committed tip change.
struct ChainSwitch {
    /// Tip first.
    disconnected: Vec<DisconnectedBlock>,
    /// Lowest first.
    connected: Vec<ChainedHeaderBlock>,
}

enum Activation {
    Committed(ChainSwitch),
    /// A block failed full validation; the chain is back at the old tip.
    Rejected { hash: Hash, error: ConsensusError },
}

enum StepFailure {
    Invalid { hash: Hash, error: ConsensusError },
    Error(Error),
}

impl From<Error> for StepFailure {
    fn from(err: Error) -> Self {
        StepFailure::Error(err)
    }
}

pub struct ConsensusLoop {
    context: ConsensusContext,
    engine: RuleEngine,
    chain: Mutex<ChainState>,
    mempool: Mutex<TxMempool>,
    signals: Arc<Signals>,
    relay: Arc<dyn PeerRelay>,
    blocks: Arc<dyn BlockStore>,
    cancel: CancellationToken,
    halted: RwLock<Option<String>>,
}

impl ConsensusLoop {
    /// Start from genesis on an empty (or genesis-only) coin store.
    pub fn new(
        context: ConsensusContext,
        coin_store: Arc<dyn CoinStore>,
        block_store: Arc<dyn BlockStore>,
        relay: Arc<dyn PeerRelay>,
        signals: Arc<Signals>,
    ) -> Result<Self> {
        context.config.validate()?;

        let genesis = context.params.genesis.clone();
        let index = ChainIndex::new(genesis.clone());
        let genesis_hash = index.genesis().hash;
        let coins = CachedCoinView::new(
            coin_store,
            genesis_hash,
            context.config.coin_cache.clone(),
            context.config.max_reorg_depth,
        )?;
        block_store.put(genesis_hash, Arc::new(Block { header: genesis, transactions: Vec::new() }))?;

        let engine = RuleEngine::for_params(&context);
        let mempool = TxMempool::new(context.config.mempool.clone());
        info!(
            genesis = %hash_to_hex(&genesis_hash),
            variant = ?context.params.variant,
            rules = engine.rule_names().len(),
            "consensus loop ready"
        );

        Ok(Self {
            context,
            engine,
            chain: Mutex::new(ChainState {
                index,
                coins,
                body_requested: HashSet::new(),
                parked: Vec::new(),
                parked_bodies: HashMap::new(),
                sources: HashMap::new(),
            }),
            mempool: Mutex::new(mempool),
            signals,
            relay,
            blocks: block_store,
            cancel: CancellationToken::new(),
            halted: RwLock::new(None),
        })
    }

    /// Share a node-wide cancellation token instead of a private one.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // ============================================================================
    // INBOUND
    // ============================================================================

    /// Header from a peer; on success its body is requested from the relay.
    pub fn submit_header(&self, header: BlockHeader, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.with_chain(|chain, actions| self.accept_header(chain, header, peer, true, actions))
    }

    /// Body for a header accepted earlier under `advertised_hash`.
    pub fn deliver_block(&self, advertised_hash: Hash, block: Block, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        let block = Arc::new(block);
        self.with_chain(|chain, actions| self.accept_body(chain, advertised_hash, block, peer, actions))
    }

    /// Header and body together.
    pub fn submit_block(&self, block: Block, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        let block = Arc::new(block);
        let hash = block_hash(&block.header);
        self.with_chain(|chain, actions| {
            match self.accept_header(chain, block.header.clone(), peer, false, actions)? {
                SubmitOutcome::Accepted | SubmitOutcome::AlreadyKnown => {
                    self.accept_body(chain, hash, block, peer, actions)
                }
                SubmitOutcome::Deferred(reason) => {
                    chain.park_body(hash, block, peer);
                    Ok(SubmitOutcome::Deferred(reason))
                }
                rejected => Ok(rejected),
            }
        })
    }

    /// SubmitTransaction: 𝒯𝒳 → {accepted, rejected}
    ///
    /// 1. Context-free checks, before the chain lock is taken
    /// 2. Under the chain lock, resolve inputs against the current tip
    /// 3. Admit to the mempool; announce and notify on success
    ///
    /// Mempool rejections never carry a misbehavior score.
    pub fn submit_transaction(&self, tx: Transaction, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.ensure_running()?;
        let id = txid(&tx);
        {
            let mempool = self.mempool.lock();
            if mempool.contains(&id) {
                return Ok(SubmitOutcome::AlreadyKnown);
            }
            if let Err(err) = mempool.check_standalone(&tx) {
                debug!(txid = %hash_to_hex(&id), code = err.code(), "transaction rejected before admission");
                return Ok(mempool_rejection(&err));
            }
        }

        self.with_chain(|chain, actions| {
            let verdict = {
                let mut mempool = self.mempool.lock();
                self.admit(chain, &mut mempool, tx.clone())?
            };
            match verdict {
                Ok(accepted) => {
                    debug!(
                        txid = %hash_to_hex(&id),
                        fee = accepted.fee,
                        replaced = accepted.replaced.len(),
                        peer = ?peer,
                        "transaction accepted"
                    );
                    self.signals.publish(&TransactionReceived(tx));
                    actions.push(RelayAction::Inventory(InventoryItem::Transaction(id)));
                    Ok(SubmitOutcome::Accepted)
                }
                Err(err) => {
                    debug!(txid = %hash_to_hex(&id), code = err.code(), %err, "transaction rejected");
                    Ok(mempool_rejection(&err))
                }
            }
        })
    }

    /// Operator action: treat `hash` and its descendants as invalid.
    ///
    /// If the block is on the active chain the tip first moves back to its
    /// parent; the best remaining chain is then activated. Returns `false`
    /// for unknown blocks and for genesis, and refuses (`reorg-too-deep`)
    /// to disconnect blocks whose undo records may already be pruned.
    pub fn invalidate_block(&self, hash: &Hash) -> Result<bool> {
        self.with_chain(|chain, actions| {
            let (height, parent) = match chain.index.get_header(hash) {
                Some(node) => match node.previous {
                    Some(parent) => (node.height, parent),
                    None => return Ok(false),
                },
                None => return Ok(false),
            };

            if chain.index.is_on_active_chain(hash) {
                let tip = chain.index.tip().hash;
                let plan = plan_reorganization(&chain.index, &tip, &parent, Natural::MAX)?;
                check_undo_horizon(&plan, chain.coins.undo_horizon())?;
                match self.apply_plan(chain, &plan)? {
                    Activation::Committed(switch) => {
                        let marked = chain.index.mark_invalid(hash);
                        chain.forget(&marked);
                        self.commit_switch(chain, switch, actions)?;
                    }
                    Activation::Rejected { .. } => {
                        return Err(Error::InconsistentState("disconnecting blocks failed validation".to_string()));
                    }
                }
            } else {
                let marked = chain.index.mark_invalid(hash);
                chain.forget(&marked);
            }
            warn!(hash = %hash_to_hex(hash), height, "block invalidated");

            self.activate_best_chain(chain, actions)?;
            Ok(true)
        })
    }

    /// Run every parked header through acceptance again, then every parked
    /// body whose header is indexed, lowest first.
    pub fn retry_deferred(&self) -> Result<Vec<(Hash, SubmitOutcome)>> {
        self.with_chain(|chain, actions| {
            let parked = std::mem::take(&mut chain.parked);
            let mut outcomes = Vec::with_capacity(parked.len());
            let mut pending = parked.into_iter();

            while let Some(entry) = pending.next() {
                let hash = entry.hash;
                let outcome = match self.accept_header(chain, entry.header, entry.peer, entry.request_body, actions) {
                    Ok(outcome) => outcome,
                    Err(Error::UnknownParent(parent)) => SubmitOutcome::Rejected {
                        code: "prev-blk-not-found",
                        reason: format!("parent {} was dropped", hash_to_hex(&parent)),
                        misbehavior: None,
                    },
                    Err(err) => {
                        chain.parked.extend(pending);
                        return Err(err);
                    }
                };

                let outcome = match (outcome, chain.parked_bodies.remove(&hash)) {
                    (SubmitOutcome::Accepted | SubmitOutcome::AlreadyKnown, Some((block, peer))) => {
                        match self.accept_body(chain, hash, block, peer, actions) {
                            Ok(outcome) => outcome,
                            Err(err) => {
                                chain.parked.extend(pending);
                                return Err(err);
                            }
                        }
                    }
                    (SubmitOutcome::Deferred(reason), Some((block, peer))) => {
                        chain.park_body(hash, block, peer);
                        SubmitOutcome::Deferred(reason)
                    }
                    (outcome, _) => outcome,
                };
                outcomes.push((hash, outcome));
            }

            let mut waiting: Vec<(Natural, Hash)> = chain
                .parked_bodies
                .keys()
                .filter_map(|hash| chain.index.get_header(hash).map(|node| (node.height, *hash)))
                .collect();
            waiting.sort_unstable();
            for (_, hash) in waiting {
                if let Some((block, peer)) = chain.parked_bodies.remove(&hash) {
                    let outcome = self.accept_body(chain, hash, block, peer, actions)?;
                    outcomes.push((hash, outcome));
                }
            }
            Ok(outcomes)
        })
    }

    // ============================================================================
    // QUERIES
    // ============================================================================

    pub fn tip(&self) -> ChainedHeader {
        self.chain.lock().index.tip().clone()
    }

    pub fn height(&self) -> Natural {
        self.chain.lock().index.height()
    }

    pub fn header(&self, hash: &Hash) -> Option<ChainedHeader> {
        self.chain.lock().index.get_header(hash).cloned()
    }

    /// Active chain header at `height`
    pub fn header_at(&self, height: Natural) -> Option<ChainedHeader> {
        self.chain.lock().index.get_by_height(height).cloned()
    }

    pub fn block_status(&self, hash: &Hash) -> Option<BlockStatus> {
        let chain = self.chain.lock();
        if let Some(node) = chain.index.get_header(hash) {
            let status = match node.state {
                ValidationState::Invalid => BlockStatus::Invalid,
                ValidationState::FullyValidated | ValidationState::AssumedValid => BlockStatus::FullyValidated,
                ValidationState::PartiallyValidated => BlockStatus::PartiallyValidated,
                ValidationState::HeaderValid if chain.body_requested.contains(hash) => BlockStatus::BodyRequested,
                ValidationState::HeaderValid => BlockStatus::HeaderValidated,
            };
            return Some(status);
        }
        chain.parked.iter().find(|parked| parked.hash == *hash).map(|parked| {
            if parked.behind_parent {
                BlockStatus::HeaderSeen
            } else {
                BlockStatus::Deferred
            }
        })
    }

    /// Unspent coin at the current tip
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let mut chain = self.chain.lock();
        let mut coins = chain.coins.fetch_utxos(std::slice::from_ref(outpoint))?;
        Ok(coins.remove(outpoint))
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn mempool_contains(&self, txid: &Hash) -> bool {
        self.mempool.lock().contains(txid)
    }

    /// Mempool transactions for a block template.
    pub fn block_template_transactions(&self, max_bytes: usize) -> Vec<Transaction> {
        self.mempool.lock().select_for_block(max_bytes)
    }

    pub fn check_mempool_consistency(&self) -> std::result::Result<(), String> {
        self.mempool.lock().check_consistency()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    pub fn context(&self) -> &ConsensusContext {
        &self.context
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    pub fn relay(&self) -> &Arc<dyn PeerRelay> {
        &self.relay
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ============================================================================
    // LIFECYCLE
    // ============================================================================

    /// Persist the coin cache.
    pub fn flush(&self) -> Result<()> {
        let result = self.chain.lock().coins.flush();
        if let Err(err) = &result {
            self.check_fatal(err);
        }
        result
    }

    /// Cancel in-flight work and flush. Later submissions fail with
    /// [`Error::Cancelled`].
    pub fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        info!("consensus loop shutting down");
        self.flush()
    }

    fn ensure_running(&self) -> Result<()> {
        if let Some(reason) = self.halted.read().as_ref() {
            return Err(Error::Halted(reason.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn check_fatal(&self, err: &Error) {
        if err.is_fatal() {
            error!(%err, "fatal chain state error, halting chain processing");
            *self.halted.write() = Some(err.to_string());
        }
    }

    /// Run `operation` under the chain lock, then issue its relay callbacks.
    fn with_chain<T>(
        &self,
        operation: impl FnOnce(&mut ChainState, &mut Vec<RelayAction>) -> Result<T>,
    ) -> Result<T> {
        self.ensure_running()?;
        let mut actions = Vec::new();
        let result = {
            let mut chain = self.chain.lock();
            operation(&mut chain, &mut actions)
        };
        if let Err(err) = &result {
            self.check_fatal(err);
        }
        self.dispatch(actions);
        result
    }

    fn dispatch(&self, actions: Vec<RelayAction>) {
        for action in actions {
            trace!(?action, "relay callback");
            match action {
                RelayAction::RequestBody(hash, peer) => self.relay.request_block_body(hash, peer),
                RelayAction::Inventory(item) => self.relay.inventory(item),
                RelayAction::Misbehaving(peer, score, reason) => self.relay.misbehaving(peer, score, &reason),
            }
        }
    }

    // ============================================================================
    // HEADERS AND BODIES
    // ============================================================================

    /// AcceptHeader: ℋ × 𝒞ℐ → {accepted, deferred, rejected}
    ///
    /// 1. Known headers are answered from the index
    /// 2. A parent that is itself deferred parks the header too
    /// 3. A parent that is invalid rejects it (bad-prevblk)
    /// 4. Header rules run on the prepared node before it is inserted
    fn accept_header(
        &self,
        chain: &mut ChainState,
        header: BlockHeader,
        peer: Option<PeerId>,
        request_body: bool,
        actions: &mut Vec<RelayAction>,
    ) -> Result<SubmitOutcome> {
        let hash = block_hash(&header);
        if let Some(node) = chain.index.get_header(&hash) {
            if node.is_invalid() {
                return Ok(duplicate_invalid(&hash));
            }
            return Ok(SubmitOutcome::AlreadyKnown);
        }
        if chain.parked.iter().any(|parked| parked.hash == hash) {
            return Ok(SubmitOutcome::Deferred("header is already waiting".to_string()));
        }

        let parent_invalid = match chain.index.get_header(&header.prev_block_hash) {
            Some(parent) => parent.is_invalid(),
            None if chain.parked.iter().any(|parked| parked.hash == header.prev_block_hash) => {
                debug!(hash = %hash_to_hex(&hash), "parent header is deferred, parking");
                chain.park_header(ParkedHeader { hash, header, peer, request_body, behind_parent: true });
                return Ok(SubmitOutcome::Deferred("parent header is deferred".to_string()));
            }
            None => return Err(Error::UnknownParent(header.prev_block_hash)),
        };

        let mut node = chain.index.prepare(header)?;
        if parent_invalid {
            let err = ConsensusError::BadPrevBlock;
            warn!(hash = %hash_to_hex(&hash), height = node.height, "header builds on an invalid block");
            node.state = ValidationState::Invalid;
            chain.index.insert(node);
            penalize(actions, peer, &err);
            return Ok(SubmitOutcome::rejected(&err));
        }

        let verdict = {
            let mut ctx = RuleContext::new(&self.context, &chain.index, &node).with_cancel(&self.cancel);
            self.engine.validate_header(&mut ctx)
        };

        match verdict {
            Ok(()) => {
                let height = node.height;
                chain.index.insert(node);
                if let Some(peer) = peer {
                    chain.sources.insert(hash, peer);
                }
                if request_body {
                    chain.body_requested.insert(hash);
                    actions.push(RelayAction::RequestBody(hash, peer));
                }
                debug!(height, hash = %hash_to_hex(&hash), "header accepted");
                Ok(SubmitOutcome::Accepted)
            }
            Err(RuleError::Deferred(reason)) => {
                debug!(hash = %hash_to_hex(&hash), %reason, "header deferred");
                chain.park_header(ParkedHeader { hash, header: node.header, peer, request_body, behind_parent: false });
                Ok(SubmitOutcome::Deferred(reason))
            }
            Err(RuleError::Consensus(err)) => {
                warn!(hash = %hash_to_hex(&hash), code = err.code(), %err, "header rejected");
                if err.marks_invalid() {
                    node.state = ValidationState::Invalid;
                    chain.index.insert(node);
                }
                penalize(actions, peer, &err);
                Ok(SubmitOutcome::rejected(&err))
            }
            Err(RuleError::Cancelled) => Err(Error::Cancelled),
        }
    }

    /// AcceptBody: ℬ × 𝒞ℐ → {accepted, rejected}
    ///
    /// 1. The body must belong to an accepted header
    /// 2. Integrity rules: a mismatching body is the peer's fault, the
    ///    header stays valid
    /// 3. Partial rules: failure marks the header and descendants invalid
    /// 4. Store the body and activate the best chain
    fn accept_body(
        &self,
        chain: &mut ChainState,
        advertised_hash: Hash,
        block: Arc<Block>,
        peer: Option<PeerId>,
        actions: &mut Vec<RelayAction>,
    ) -> Result<SubmitOutcome> {
        let node = match chain.index.get_header(&advertised_hash) {
            Some(node) => node.clone(),
            None if chain.parked.iter().any(|parked| parked.hash == advertised_hash) => {
                chain.park_body(advertised_hash, block, peer);
                return Ok(SubmitOutcome::Deferred("header is deferred".to_string()));
            }
            None => {
                return Ok(SubmitOutcome::Rejected {
                    code: "block-not-requested",
                    reason: format!("no accepted header {}", hash_to_hex(&advertised_hash)),
                    misbehavior: None,
                })
            }
        };
        if node.is_invalid() {
            return Ok(duplicate_invalid(&advertised_hash));
        }
        if node.has_body {
            return Ok(SubmitOutcome::AlreadyKnown);
        }

        let integrity = {
            let mut ctx = RuleContext::new(&self.context, &chain.index, &node)
                .with_block(&block)
                .with_advertised_hash(advertised_hash)
                .with_cancel(&self.cancel);
            self.engine.validate_integrity(&mut ctx)
        };
        match integrity {
            Ok(()) => {}
            Err(RuleError::Consensus(err)) => {
                warn!(hash = %hash_to_hex(&advertised_hash), code = err.code(), "delivered body does not match its header");
                penalize(actions, peer, &err);
                return Ok(SubmitOutcome::rejected(&err));
            }
            Err(RuleError::Deferred(reason)) => {
                chain.park_body(advertised_hash, block, peer);
                return Ok(SubmitOutcome::Deferred(reason));
            }
            Err(RuleError::Cancelled) => return Err(Error::Cancelled),
        }

        let partial = {
            let mut ctx = RuleContext::new(&self.context, &chain.index, &node).with_block(&block).with_cancel(&self.cancel);
            self.engine.validate_partial(&mut ctx)
        };
        match partial {
            Ok(()) => {}
            Err(RuleError::Consensus(err)) => {
                warn!(hash = %hash_to_hex(&advertised_hash), code = err.code(), %err, "block rejected");
                if err.marks_invalid() {
                    let marked = chain.index.mark_invalid(&advertised_hash);
                    chain.forget(&marked);
                }
                penalize(actions, peer, &err);
                return Ok(SubmitOutcome::rejected(&err));
            }
            Err(RuleError::Deferred(reason)) => {
                chain.park_body(advertised_hash, block, peer);
                return Ok(SubmitOutcome::Deferred(reason));
            }
            Err(RuleError::Cancelled) => return Err(Error::Cancelled),
        }

        self.blocks.put(advertised_hash, block)?;
        chain.index.set_state(&advertised_hash, ValidationState::PartiallyValidated);
        chain.body_requested.remove(&advertised_hash);
        if let Some(peer) = peer {
            chain.sources.insert(advertised_hash, peer);
        }
        let connectable = chain.index.set_body(&advertised_hash);
        debug!(height = node.height, connectable = connectable.len(), "block body accepted");

        let failures = self.activate_best_chain(chain, actions)?;
        if let Some((_, err)) = failures.iter().find(|(hash, _)| *hash == advertised_hash) {
            return Ok(SubmitOutcome::rejected(err));
        }
        if chain.index.get_header(&advertised_hash).map_or(false, ChainedHeader::is_invalid) {
            return Ok(SubmitOutcome::Rejected {
                code: ConsensusError::BadPrevBlock.code(),
                reason: "an ancestor failed validation".to_string(),
                misbehavior: None,
            });
        }
        Ok(SubmitOutcome::Accepted)
    }

    // ============================================================================
    // CHAIN ACTIVATION
    // ============================================================================

    /// ActivateBestChain: 𝒞ℐ × 𝒰𝒮 → 𝒞ℐ × 𝒰𝒮
    ///
    /// While some connectable candidate has strictly more work than the tip:
    /// 1. Plan the switch; a plan deeper than the reorg limit, or reaching
    ///    below the retained undo records, marks the candidate branch invalid
    /// 2. Disconnect and connect per the plan, rolling back on failure
    /// 3. On commit update the mempool, then publish notifications
    /// 4. After the tip moved, forget branches below the reorg limit
    ///
    /// Returns the blocks that failed along the way.
    fn activate_best_chain(
        &self,
        chain: &mut ChainState,
        actions: &mut Vec<RelayAction>,
    ) -> Result<Vec<(Hash, ConsensusError)>> {
        let max_depth = self.context.config.max_reorg_depth;
        let mut failures = Vec::new();
        let mut tip_moved = false;

        loop {
            let (tip_hash, tip_work) = {
                let tip = chain.index.tip();
                (tip.hash, tip.chain_work)
            };
            let (best_hash, best_work) = {
                let best = chain.index.best_candidate();
                (best.hash, best.chain_work)
            };
            if !should_reorganize(tip_work, best_work) {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let horizon = chain.coins.undo_horizon();
            let planned = plan_reorganization(&chain.index, &tip_hash, &best_hash, max_depth)
                .and_then(|plan| check_undo_horizon(&plan, horizon).map(|()| plan));
            let plan = match planned {
                Ok(plan) => plan,
                Err(Error::Consensus(err)) => {
                    let root = branch_root(&chain.index, &tip_hash, &best_hash)?;
                    warn!(candidate = %hash_to_hex(&best_hash), %err, "refusing reorganization");
                    reject_block(chain, &root, &err, actions);
                    failures.push((root, err));
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self.apply_plan(chain, &plan)? {
                Activation::Committed(switch) => {
                    self.commit_switch(chain, switch, actions)?;
                    tip_moved = true;
                }
                Activation::Rejected { hash, error } => {
                    reject_block(chain, &hash, &error, actions);
                    failures.push((hash, error));
                }
            }
        }

        if !tip_moved {
            return Ok(failures);
        }
        let pruned = chain.index.prune(max_depth);
        if !pruned.is_empty() {
            chain.forget(&pruned);
            debug!(count = pruned.len(), "pruned stale branches");
        }
        Ok(failures)
    }

    /// Execute a plan all-or-nothing: any failure puts the old tip back.
    fn apply_plan(&self, chain: &mut ChainState, plan: &ReorgPlan) -> Result<Activation> {
        let mut disconnected = Vec::with_capacity(plan.disconnect.len());
        for hash in &plan.disconnect {
            match self.disconnect_tip(chain, hash) {
                Ok(block) => disconnected.push(block),
                Err(err) => return Err(self.abandon(chain, &[], &disconnected, err)),
            }
        }

        let mut connected = Vec::with_capacity(plan.connect.len());
        for hash in &plan.connect {
            match self.connect_tip(chain, hash) {
                Ok(block) => connected.push(block),
                Err(StepFailure::Invalid { hash, error }) => {
                    warn!(hash = %hash_to_hex(&hash), code = error.code(), %error, "block failed to connect");
                    self.roll_back(chain, &connected, &disconnected)?;
                    return Ok(Activation::Rejected { hash, error });
                }
                Err(StepFailure::Error(err)) => return Err(self.abandon(chain, &connected, &disconnected, err)),
            }
        }

        Ok(Activation::Committed(ChainSwitch { disconnected, connected }))
    }

    /// Put the old tip back after `cause`; the error to report.
    ///
    /// A failed store write may have left the coin view ahead of the index,
    /// so storage errors are reported without a rollback.
    fn abandon(
        &self,
        chain: &mut ChainState,
        connected: &[ChainedHeaderBlock],
        disconnected: &[DisconnectedBlock],
        cause: Error,
    ) -> Error {
        if matches!(cause, Error::Storage(_)) {
            return cause;
        }
        match self.roll_back(chain, connected, disconnected) {
            Ok(()) => cause,
            Err(err) => {
                error!(%err, %cause, "rollback failed");
                if cause.is_fatal() {
                    cause
                } else {
                    err
                }
            }
        }
    }

    fn roll_back(
        &self,
        chain: &mut ChainState,
        connected: &[ChainedHeaderBlock],
        disconnected: &[DisconnectedBlock],
    ) -> Result<()> {
        for block in connected.iter().rev() {
            self.disconnect_tip(chain, &block.header.hash)?;
        }
        for block in disconnected.iter().rev() {
            let hash = block.entry.header.hash;
            let changes = connect_changes(hash, &block.entry.block, block.undo.clone());
            chain.coins.save_changes(changes, hash, block.entry.header.height)?;
            chain.index.set_tip(&hash)?;
        }
        info!(
            tip = %hash_to_hex(&chain.index.tip().hash),
            height = chain.index.height(),
            "rolled back to the previous tip"
        );
        Ok(())
    }

    fn disconnect_tip(&self, chain: &mut ChainState, hash: &Hash) -> Result<DisconnectedBlock> {
        let tip = chain.index.tip().clone();
        if tip.hash != *hash {
            return Err(Error::InconsistentState(format!(
                "cannot disconnect {}: tip is {}",
                hash_to_hex(hash),
                hash_to_hex(&tip.hash)
            )));
        }
        let parent = tip
            .previous
            .ok_or_else(|| Error::InconsistentState("cannot disconnect genesis".to_string()))?;
        let block = self.load_block(hash)?;
        let undo = chain
            .coins
            .get_undo_data(hash)?
            .ok_or_else(|| Error::InconsistentState(format!("no undo data for {}", hash_to_hex(hash))))?;

        let changes = disconnect_changes(*hash, &block, undo.clone());
        chain.coins.save_changes(changes, parent, tip.height - 1)?;
        chain.index.set_tip(&parent)?;
        debug!(height = tip.height, hash = %hash_to_hex(hash), "block disconnected");

        Ok(DisconnectedBlock { entry: ChainedHeaderBlock { header: tip, block }, undo })
    }

    /// Fully validate the child of the tip and make it the tip.
    fn connect_tip(&self, chain: &mut ChainState, hash: &Hash) -> std::result::Result<ChainedHeaderBlock, StepFailure> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let mut node = chain
            .index
            .get_header(hash)
            .cloned()
            .ok_or_else(|| Error::InconsistentState(format!("block {} is not indexed", hash_to_hex(hash))))?;
        if node.previous != Some(chain.index.tip().hash) {
            return Err(Error::InconsistentState(format!("{} does not extend the tip", hash_to_hex(hash))).into());
        }

        let block = self.load_block(hash)?;
        let coins = chain.coins.fetch_utxos(&block_prevouts(&block))?;
        let assumed = self.is_assumed_valid(&chain.index, &node);

        let verdict = {
            let mut ctx = RuleContext::new(&self.context, &chain.index, &node)
                .with_block(&block)
                .with_coins(&coins)
                .with_cancel(&self.cancel)
                .skip_scripts(assumed);
            let verdict = self.engine.validate_full(&mut ctx);
            verdict.map(|()| ctx.coin_changes.take())
        };
        let changes = match verdict {
            Ok(Some(changes)) => changes,
            Ok(None) => {
                return Err(Error::InconsistentState("full validation produced no coin changes".to_string()).into())
            }
            Err(RuleError::Consensus(error)) => return Err(StepFailure::Invalid { hash: *hash, error }),
            Err(RuleError::Deferred(reason)) => {
                return Err(Error::InconsistentState(format!("full validation deferred: {reason}")).into())
            }
            Err(RuleError::Cancelled) => return Err(Error::Cancelled.into()),
        };

        chain.coins.save_changes(changes, *hash, node.height)?;
        chain.index.set_tip(hash)?;
        node.state = if assumed { ValidationState::AssumedValid } else { ValidationState::FullyValidated };
        chain.index.set_state(hash, node.state);
        chain.sources.remove(hash);
        debug!(height = node.height, hash = %hash_to_hex(hash), assumed, "block connected");

        Ok(ChainedHeaderBlock { header: node, block })
    }

    /// Mempool first, then notifications, then the tip announcement.
    fn commit_switch(&self, chain: &mut ChainState, switch: ChainSwitch, actions: &mut Vec<RelayAction>) -> Result<()> {
        let ChainSwitch { disconnected, connected } = switch;
        self.update_mempool(chain, &disconnected, &connected)?;

        for block in &disconnected {
            self.signals.publish(&BlockDisconnected(block.entry.clone()));
        }
        for block in &connected {
            self.signals.publish(&BlockConnected(block.clone()));
        }

        let tip = chain.index.tip();
        if disconnected.is_empty() {
            info!(height = tip.height, hash = %hash_to_hex(&tip.hash), connected = connected.len(), "new chain tip");
        } else {
            info!(
                height = tip.height,
                hash = %hash_to_hex(&tip.hash),
                disconnected = disconnected.len(),
                connected = connected.len(),
                "chain reorganized"
            );
        }
        actions.push(RelayAction::Inventory(InventoryItem::Block(tip.hash)));
        Ok(())
    }

    /// Confirmed and conflicting entries leave; transactions of disconnected
    /// blocks are offered again, lowest block first, and dropped quietly if
    /// they no longer fit.
    fn update_mempool(
        &self,
        chain: &mut ChainState,
        disconnected: &[DisconnectedBlock],
        connected: &[ChainedHeaderBlock],
    ) -> Result<()> {
        let mut mempool = self.mempool.lock();
        for block in connected {
            mempool.remove_for_block(&block.block);
        }

        if !disconnected.is_empty() {
            let mut reoffered = 0usize;
            for block in disconnected.iter().rev() {
                for tx in block.entry.block.transactions.iter().filter(|tx| !is_coinbase(tx)) {
                    match self.admit(chain, &mut mempool, tx.clone())? {
                        Ok(_) => reoffered += 1,
                        Err(err) => trace!(txid = %hash_to_hex(&txid(tx)), code = err.code(), "dropped transaction of disconnected block"),
                    }
                }
            }

            let coins = chain.coins.fetch_utxos(&mempool.chain_prevouts())?;
            let removed = mempool.remove_for_reorg(&coins, chain.index.height() + 1, self.context.params.maturity);
            debug!(reoffered, removed = removed.len(), "mempool updated after disconnect");
        }

        let expired = mempool.expire(self.context.now());
        if expired > 0 {
            debug!(expired, "mempool entries expired");
        }
        Ok(())
    }

    /// Mempool admission against the current tip. The outer error is a
    /// storage failure, the inner one a rejection.
    fn admit(
        &self,
        chain: &mut ChainState,
        mempool: &mut TxMempool,
        tx: Transaction,
    ) -> Result<std::result::Result<MempoolAccept, MempoolError>> {
        let prevouts: Vec<OutPoint> = tx.inputs.iter().map(|input| input.prevout.clone()).collect();
        let coins = chain.coins.fetch_utxos(&prevouts)?;
        let tip = chain.index.tip();
        let ctx = AdmissionContext {
            chain_coins: &coins,
            spend_height: tip.height + 1,
            median_time_past: chain.index.median_time_past(&tip.hash),
            now: self.context.now(),
            maturity: self.context.params.maturity,
            signature: self.context.params.signature,
        };
        Ok(mempool.accept_to_memory_pool(tx, &ctx))
    }

    fn load_block(&self, hash: &Hash) -> Result<Arc<Block>> {
        self.blocks
            .get(hash)?
            .ok_or_else(|| Error::InconsistentState(format!("body of {} is missing from the block store", hash_to_hex(hash))))
    }

    /// `node` lies on the branch leading to the configured assume-valid block.
    fn is_assumed_valid(&self, index: &ChainIndex, node: &ChainedHeader) -> bool {
        match &self.context.config.assume_valid {
            Some(assumed) => index.ancestor(assumed, node.height).map_or(false, |ancestor| ancestor.hash == node.hash),
            None => false,
        }
    }
}

/// First block of the branch from the fork of `tip` and `candidate` towards `candidate`
fn branch_root(index: &ChainIndex, tip: &Hash, candidate: &Hash) -> Result<Hash> {
    let fork_height = index
        .find_fork(tip, candidate)
        .map(|fork| fork.height)
        .ok_or_else(|| Error::InconsistentState("candidate shares no ancestor with the tip".to_string()))?;
    index
        .ancestor(candidate, fork_height + 1)
        .map(|root| root.hash)
        .ok_or_else(|| Error::InconsistentState("candidate branch is not indexed".to_string()))
}

fn reject_block(chain: &mut ChainState, hash: &Hash, err: &ConsensusError, actions: &mut Vec<RelayAction>) {
    let source = chain.sources.get(hash).copied();
    let marked = chain.index.mark_invalid(hash);
    chain.forget(&marked);
    penalize(actions, source, err);
}

fn penalize(actions: &mut Vec<RelayAction>, peer: Option<PeerId>, err: &ConsensusError) {
    if let (Some(peer), Some(score)) = (peer, err.misbehavior_score()) {
        actions.push(RelayAction::Misbehaving(peer, score, err.code().to_string()));
    }
}

fn duplicate_invalid(hash: &Hash) -> SubmitOutcome {
    SubmitOutcome::Rejected {
        code: "duplicate-invalid",
        reason: format!("{} is known to be invalid", hash_to_hex(hash)),
        misbehavior: None,
    }
}

fn mempool_rejection(err: &MempoolError) -> SubmitOutcome {
    SubmitOutcome::Rejected { code: err.code(), reason: err.to_string(), misbehavior: None }
}
