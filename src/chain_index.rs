//! Block header tree with cumulative work and the active chain
//!
//! Every known header is a node keyed by its hash; the active chain is the
//! path from genesis to the current tip. Only the consensus loop mutates the
//! index, always under the chain lock.

use crate::error::{Error, Result};
use crate::hashing::{block_hash, hash_to_hex};
use crate::pow::block_work;
use crate::types::*;
use primitive_types::U256;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationState {
    /// Header rules passed; body not yet validated.
    HeaderValid,
    /// Context-free body rules passed.
    PartiallyValidated,
    /// Connected with full validation.
    FullyValidated,
    /// Connected below the assume-valid point; scripts were not checked.
    AssumedValid,
    Invalid,
}

impl ValidationState {
    pub fn is_connected_state(&self) -> bool {
        matches!(self, ValidationState::FullyValidated | ValidationState::AssumedValid)
    }
}

/// A header placed in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedHeader {
    pub hash: Hash,
    pub header: BlockHeader,
    pub height: Natural,
    /// Sum of the work of this block and all its ancestors.
    pub chain_work: U256,
    pub previous: Option<Hash>,
    pub state: ValidationState,
    /// Arrival order among connectable blocks; lower wins work ties.
    pub sequence_id: Option<u64>,
    pub has_body: bool,
}

impl ChainedHeader {
    /// Body and all ancestor bodies are present.
    pub fn is_connectable(&self) -> bool {
        self.sequence_id.is_some()
    }

    pub fn is_invalid(&self) -> bool {
        self.state == ValidationState::Invalid
    }

    fn candidate_key(&self) -> Option<CandidateKey> {
        self.sequence_id.map(|id| (self.chain_work, Reverse(id), self.hash))
    }
}

/// Orders tip candidates: most work last, then the earliest sequence id.
type CandidateKey = (U256, Reverse<u64>, Hash);

#[derive(Debug)]
pub struct ChainIndex {
    nodes: HashMap<Hash, ChainedHeader>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Hashes of the active chain by height.
    active: Vec<Hash>,
    /// Connectable nodes that are not invalid.
    candidates: BTreeSet<CandidateKey>,
    next_sequence_id: u64,
}

impl ChainIndex {
    /// Index containing only `genesis`, which is the tip.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = block_hash(&genesis);
        let node = ChainedHeader {
            hash,
            chain_work: block_work(genesis.bits),
            header: genesis,
            height: 0,
            previous: None,
            state: ValidationState::FullyValidated,
            sequence_id: Some(0),
            has_body: true,
        };

        let candidates = node.candidate_key().into_iter().collect();
        let mut nodes = HashMap::new();
        nodes.insert(hash, node);
        Self { nodes, children: HashMap::new(), active: vec![hash], candidates, next_sequence_id: 1 }
    }

    /// Compute the node `header` would become, without inserting it.
    pub fn prepare(&self, header: BlockHeader) -> Result<ChainedHeader> {
        let parent = self
            .nodes
            .get(&header.prev_block_hash)
            .ok_or(Error::UnknownParent(header.prev_block_hash))?;

        Ok(ChainedHeader {
            hash: block_hash(&header),
            height: parent.height + 1,
            chain_work: parent.chain_work + block_work(header.bits),
            previous: Some(parent.hash),
            state: ValidationState::HeaderValid,
            sequence_id: None,
            has_body: false,
            header,
        })
    }

    /// Store a prepared node. An existing node with the same hash wins.
    pub fn insert(&mut self, node: ChainedHeader) -> &ChainedHeader {
        let hash = node.hash;
        if !self.nodes.contains_key(&hash) {
            if let Some(previous) = node.previous {
                self.children.entry(previous).or_default().push(hash);
            }
            self.nodes.insert(hash, node);
        }
        &self.nodes[&hash]
    }

    /// Add a header whose parent is known.
    pub fn add(&mut self, header: BlockHeader) -> Result<&ChainedHeader> {
        let hash = block_hash(&header);
        if self.nodes.contains_key(&hash) {
            return Ok(&self.nodes[&hash]);
        }
        let node = self.prepare(header)?;
        Ok(self.insert(node))
    }

    pub fn get_header(&self, hash: &Hash) -> Option<&ChainedHeader> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Header at `height` on the active chain
    pub fn get_by_height(&self, height: Natural) -> Option<&ChainedHeader> {
        self.active.get(height as usize).and_then(|hash| self.nodes.get(hash))
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.nodes[&self.active[self.active.len() - 1]]
    }

    pub fn height(&self) -> Natural {
        (self.active.len() - 1) as Natural
    }

    pub fn genesis(&self) -> &ChainedHeader {
        &self.nodes[&self.active[0]]
    }

    pub fn is_on_active_chain(&self, hash: &Hash) -> bool {
        match self.nodes.get(hash) {
            Some(node) => self.active.get(node.height as usize) == Some(hash),
            None => false,
        }
    }

    pub fn children(&self, hash: &Hash) -> &[Hash] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ancestor of `hash` at `height` (the node itself at its own height).
    pub fn ancestor(&self, hash: &Hash, height: Natural) -> Option<&ChainedHeader> {
        let mut node = self.nodes.get(hash)?;
        if height > node.height {
            return None;
        }
        if self.is_on_active_chain(hash) {
            return self.get_by_height(height);
        }
        while node.height > height {
            node = self.nodes.get(&node.previous?)?;
            if self.is_on_active_chain(&node.hash) {
                return self.get_by_height(height);
            }
        }
        Some(node)
    }

    /// Last common ancestor of two nodes.
    pub fn find_fork(&self, a: &Hash, b: &Hash) -> Option<&ChainedHeader> {
        let mut a = self.nodes.get(a)?;
        let mut b = self.nodes.get(b)?;

        while a.height > b.height {
            a = self.nodes.get(&a.previous?)?;
        }
        while b.height > a.height {
            b = self.nodes.get(&b.previous?)?;
        }
        while a.hash != b.hash {
            a = self.nodes.get(&a.previous?)?;
            b = self.nodes.get(&b.previous?)?;
        }
        Some(a)
    }

    /// Median of the timestamps of `hash` and up to ten of its ancestors.
    pub fn median_time_past(&self, hash: &Hash) -> Natural {
        let mut times = Vec::with_capacity(crate::constants::MEDIAN_TIME_SPAN);
        let mut cursor = self.nodes.get(hash);
        while let Some(node) = cursor {
            if times.len() == crate::constants::MEDIAN_TIME_SPAN {
                break;
            }
            times.push(node.header.timestamp);
            cursor = node.previous.as_ref().and_then(|previous| self.nodes.get(previous));
        }

        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn set_state(&mut self, hash: &Hash, state: ValidationState) {
        if let Some(node) = self.nodes.get_mut(hash) {
            node.state = state;
            if state == ValidationState::Invalid {
                if let Some(key) = node.candidate_key() {
                    self.candidates.remove(&key);
                }
            }
        }
    }

    /// Record that the body of `hash` is available.
    ///
    /// Returns the nodes that became connectable, in the order they received
    /// their sequence ids: the node itself if its parent is connectable, then
    /// any descendants that were only waiting for this body.
    pub fn set_body(&mut self, hash: &Hash) -> Vec<Hash> {
        let parent_connectable = match self.nodes.get_mut(hash) {
            Some(node) => {
                node.has_body = true;
                if node.sequence_id.is_some() {
                    return Vec::new();
                }
                node.previous
            }
            None => return Vec::new(),
        }
        .and_then(|previous| self.nodes.get(&previous))
        .map(ChainedHeader::is_connectable)
        .unwrap_or(false);

        if !parent_connectable {
            return Vec::new();
        }

        let mut assigned = Vec::new();
        let mut queue = VecDeque::from([*hash]);
        while let Some(current) = queue.pop_front() {
            let ready = match self.nodes.get_mut(&current) {
                Some(node) if node.has_body && node.sequence_id.is_none() => {
                    node.sequence_id = Some(self.next_sequence_id);
                    self.next_sequence_id += 1;
                    if !node.is_invalid() {
                        self.candidates.extend(node.candidate_key());
                    }
                    true
                }
                _ => false,
            };
            if ready {
                assigned.push(current);
                queue.extend(self.children(&current).iter().copied());
            }
        }
        assigned
    }

    /// Flag `hash` and every descendant invalid. Returns the flagged hashes.
    pub fn mark_invalid(&mut self, hash: &Hash) -> Vec<Hash> {
        let mut marked = Vec::new();
        let mut queue = VecDeque::from([*hash]);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get_mut(&current) {
                if node.state != ValidationState::Invalid {
                    node.state = ValidationState::Invalid;
                    if let Some(key) = node.candidate_key() {
                        self.candidates.remove(&key);
                    }
                    marked.push(current);
                }
                queue.extend(self.children(&current).iter().copied());
            }
        }
        marked
    }

    /// Connectable, non-invalid node with the most work; on equal work the
    /// one that became connectable first.
    pub fn best_candidate(&self) -> &ChainedHeader {
        self.candidates
            .last()
            .and_then(|(_, _, hash)| self.nodes.get(hash))
            .unwrap_or_else(|| self.tip())
    }

    /// Move the active chain so that it ends at `hash`.
    pub fn set_tip(&mut self, hash: &Hash) -> Result<()> {
        let mut path = Vec::new();
        let mut cursor = *hash;
        while !self.is_on_active_chain(&cursor) {
            let node = self.nodes.get(&cursor).ok_or_else(|| {
                Error::InconsistentState(format!("tip candidate {} is not indexed", hash_to_hex(&cursor)))
            })?;
            path.push(cursor);
            cursor = node.previous.ok_or_else(|| {
                Error::InconsistentState("second genesis block in chain index".to_string())
            })?;
        }

        let fork_height = self.nodes[&cursor].height as usize;
        self.active.truncate(fork_height + 1);
        self.active.extend(path.into_iter().rev());

        // a tip below the previous one on the same branch
        let target_height = self.nodes[hash].height as usize;
        self.active.truncate(target_height + 1);
        Ok(())
    }

    /// Forget side branches that fork more than `max_reorg_depth` below the
    /// tip. Returns the removed hashes.
    pub fn prune(&mut self, max_reorg_depth: Natural) -> Vec<Hash> {
        let cutoff = self.height().saturating_sub(max_reorg_depth) as usize;
        let mut stale = Vec::new();
        for height in 0..cutoff {
            let on_chain = self.active[height];
            let next = self.active.get(height + 1).copied();
            for child in self.children(&on_chain) {
                if Some(*child) != next {
                    stale.push(*child);
                }
            }
        }

        let mut removed = Vec::new();
        let mut queue: VecDeque<Hash> = stale.into_iter().collect();
        while let Some(hash) = queue.pop_front() {
            if let Some(node) = self.nodes.remove(&hash) {
                if let Some(key) = node.candidate_key() {
                    self.candidates.remove(&key);
                }
                if let Some(previous) = node.previous {
                    if let Some(siblings) = self.children.get_mut(&previous) {
                        siblings.retain(|sibling| *sibling != hash);
                    }
                }
                if let Some(children) = self.children.remove(&hash) {
                    queue.extend(children);
                }
                removed.push(hash);
            }
        }
        removed
    }
}
