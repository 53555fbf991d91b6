//! Chain reorganization planning
//!
//! The plan only names blocks; applying it (undo, validate, connect, roll
//! back) is the consensus loop's job.

use crate::chain_index::ChainIndex;
use crate::error::{ConsensusError, Error, Result};
use crate::hashing::hash_to_hex;
use crate::types::*;
use primitive_types::U256;

/// Blocks to disconnect and connect to move the tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    /// Last block shared by the old and the new chain.
    pub fork: Hash,
    pub fork_height: Natural,
    /// Old chain blocks above the fork, tip first.
    pub disconnect: Vec<Hash>,
    /// New chain blocks above the fork, lowest first.
    pub connect: Vec<Hash>,
}

impl ReorgPlan {
    pub fn depth(&self) -> Natural {
        self.disconnect.len() as Natural
    }

    /// Plain extension of the current tip.
    pub fn is_extension(&self) -> bool {
        self.disconnect.is_empty()
    }
}

/// Reorganization: moving the tip from `from_tip` to `to`
///
/// For old tip c and new tip n:
/// 1. Find the fork f = FindFork(c, n)
/// 2. Disconnect [c, parent(c), ..., child(f)] in that order
/// 3. Connect [child(f), ..., n] in that order
/// 4. Refuse when more than `max_depth` blocks would be disconnected
pub fn plan_reorganization(index: &ChainIndex, from_tip: &Hash, to: &Hash, max_depth: Natural) -> Result<ReorgPlan> {
    let fork = index.find_fork(from_tip, to).ok_or_else(|| {
        Error::InconsistentState(format!(
            "no common ancestor between {} and {}",
            hash_to_hex(from_tip),
            hash_to_hex(to)
        ))
    })?;
    let fork_hash = fork.hash;
    let fork_height = fork.height;

    let disconnect = path_to_ancestor(index, from_tip, &fork_hash)?;
    let mut connect = path_to_ancestor(index, to, &fork_hash)?;
    connect.reverse();

    let depth = disconnect.len() as Natural;
    if depth > max_depth {
        return Err(ConsensusError::ReorgTooDeep { depth, max: max_depth }.into());
    }

    Ok(ReorgPlan { fork: fork_hash, fork_height, disconnect, connect })
}

/// Refuse a plan that would disconnect a block below `undo_horizon`, the
/// lowest height whose undo record is still guaranteed to be stored.
pub fn check_undo_horizon(plan: &ReorgPlan, undo_horizon: Natural) -> Result<()> {
    if plan.is_extension() || plan.fork_height + 1 >= undo_horizon {
        return Ok(());
    }
    let tip_height = plan.fork_height + plan.depth();
    Err(ConsensusError::ReorgTooDeep { depth: plan.depth(), max: (tip_height + 1).saturating_sub(undo_horizon) }.into())
}

/// Hashes from `from` down to (excluding) `ancestor`, highest first
fn path_to_ancestor(index: &ChainIndex, from: &Hash, ancestor: &Hash) -> Result<Vec<Hash>> {
    let mut path = Vec::new();
    let mut cursor = *from;
    while cursor != *ancestor {
        let node = index.get_header(&cursor).ok_or_else(|| {
            Error::InconsistentState(format!("block {} is not indexed", hash_to_hex(&cursor)))
        })?;
        path.push(cursor);
        cursor = node.previous.ok_or_else(|| {
            Error::InconsistentState(format!("{} is not a descendant of the fork", hash_to_hex(from)))
        })?;
    }
    Ok(path)
}

/// Switch only on strictly more work; equal work keeps the current tip.
pub fn should_reorganize(current_work: U256, candidate_work: U256) -> bool {
    candidate_work > current_work
}
