//! Contracts between the consensus core and the peer/relay layer
//!
//! The core never talks to sockets. It reports what it needs (bodies for
//! accepted headers), what is new (inventory) and who misbehaved; the relay
//! layer owns framing, peer selection and ban policy.

use crate::error::ConsensusError;
use crate::hashing::hash_to_hex;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Identifier assigned to a peer connection by the relay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Object announced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryItem {
    Transaction(Hash),
    Block(Hash),
}

impl InventoryItem {
    /// Wire inventory type: 1 for transactions, 2 for blocks
    pub fn inv_type(&self) -> u32 {
        match self {
            InventoryItem::Transaction(_) => 1,
            InventoryItem::Block(_) => 2,
        }
    }

    pub fn hash(&self) -> &Hash {
        match self {
            InventoryItem::Transaction(hash) | InventoryItem::Block(hash) => hash,
        }
    }
}

/// How far a broadcast transaction has travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    /// The relay has no record of it.
    Unknown,
    /// Announced; peers are still requesting it.
    Pending,
    /// Peers stopped requesting it, so it is presumed accepted.
    Propagated,
}

/// Callbacks into the relay layer.
///
/// The consensus loop only calls these after releasing its chain lock.
pub trait PeerRelay: Send + Sync {
    fn request_block_body(&self, hash: Hash, peer: Option<PeerId>);

    fn inventory(&self, item: InventoryItem);

    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str);

    fn broadcast_state(&self, txid: &Hash) -> BroadcastState;
}

/// Relay that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRelay;

impl PeerRelay for NullRelay {
    fn request_block_body(&self, _hash: Hash, _peer: Option<PeerId>) {}

    fn inventory(&self, _item: InventoryItem) {}

    fn misbehaving(&self, _peer: PeerId, _score: u32, _reason: &str) {}

    fn broadcast_state(&self, _txid: &Hash) -> BroadcastState {
        BroadcastState::Unknown
    }
}

/// Relay that records every call; broadcast states are set by hand.
#[derive(Debug, Default)]
pub struct RecordingRelay {
    pub body_requests: Mutex<Vec<(Hash, Option<PeerId>)>>,
    pub announced: Mutex<Vec<InventoryItem>>,
    pub penalties: Mutex<Vec<(PeerId, u32, String)>>,
    broadcast: Mutex<HashMap<Hash, BroadcastState>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broadcast_state(&self, txid: Hash, state: BroadcastState) {
        self.broadcast.lock().insert(txid, state);
    }

    pub fn penalties_for(&self, peer: PeerId) -> Vec<u32> {
        self.penalties
            .lock()
            .iter()
            .filter(|(penalized, _, _)| *penalized == peer)
            .map(|(_, score, _)| *score)
            .collect()
    }
}

impl PeerRelay for RecordingRelay {
    fn request_block_body(&self, hash: Hash, peer: Option<PeerId>) {
        self.body_requests.lock().push((hash, peer));
    }

    fn inventory(&self, item: InventoryItem) {
        self.announced.lock().push(item);
    }

    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str) {
        self.penalties.lock().push((peer, score, reason.to_string()));
    }

    fn broadcast_state(&self, txid: &Hash) -> BroadcastState {
        self.broadcast.lock().get(txid).copied().unwrap_or(BroadcastState::Unknown)
    }
}

/// Result of handing a header, block or transaction to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    AlreadyKnown,
    /// Cannot be decided yet; kept and retried.
    Deferred(String),
    Rejected {
        code: &'static str,
        reason: String,
        /// Score the relay layer should add to the source peer.
        misbehavior: Option<u32>,
    },
}

impl SubmitOutcome {
    pub fn rejected(err: &ConsensusError) -> Self {
        SubmitOutcome::Rejected { code: err.code(), reason: err.to_string(), misbehavior: err.misbehavior_score() }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }

    pub fn reject_code(&self) -> Option<&'static str> {
        match self {
            SubmitOutcome::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Accepted => write!(f, "accepted"),
            SubmitOutcome::AlreadyKnown => write!(f, "already known"),
            SubmitOutcome::Deferred(reason) => write!(f, "deferred: {reason}"),
            SubmitOutcome::Rejected { code, reason, .. } => write!(f, "rejected ({code}): {reason}"),
        }
    }
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryItem::Transaction(hash) => write!(f, "tx {}", hash_to_hex(hash)),
            InventoryItem::Block(hash) => write!(f, "block {}", hash_to_hex(hash)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_types() {
        assert_eq!(InventoryItem::Transaction([1; 32]).inv_type(), 1);
        assert_eq!(InventoryItem::Block([2; 32]).inv_type(), 2);
        assert_eq!(InventoryItem::Block([2; 32]).hash(), &[2; 32]);
    }

    #[test]
    fn test_rejection_carries_code_and_score() {
        let outcome = SubmitOutcome::rejected(&ConsensusError::HighHash);
        assert_eq!(outcome.reject_code(), Some("high-hash"));
        match outcome {
            SubmitOutcome::Rejected { misbehavior, .. } => assert_eq!(misbehavior, Some(100)),
            _ => unreachable!(),
        }

        let transient = SubmitOutcome::rejected(&ConsensusError::TimeTooNew { time: 2, limit: 1 });
        assert!(matches!(transient, SubmitOutcome::Rejected { misbehavior: None, .. }));
    }

    #[test]
    fn test_recording_relay() {
        let relay = RecordingRelay::new();
        relay.misbehaving(PeerId(3), 100, "bad");
        relay.misbehaving(PeerId(4), 10, "meh");
        assert_eq!(relay.penalties_for(PeerId(3)), vec![100]);

        assert_eq!(relay.broadcast_state(&[9; 32]), BroadcastState::Unknown);
        relay.set_broadcast_state([9; 32], BroadcastState::Propagated);
        assert_eq!(relay.broadcast_state(&[9; 32]), BroadcastState::Propagated);
    }
}
