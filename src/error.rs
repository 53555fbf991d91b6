//! Error types for consensus validation and chain processing

use crate::hashing::hash_to_hex;
use crate::storage::StorageError;
use crate::types::{Hash, Integer, Natural};
use thiserror::Error;

/// A block, header or transaction broke a consensus rule.
///
/// `code()` is the stable reject code surfaced to peers and RPC callers;
/// `Display` is the human-readable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    // header rules
    #[error("block version {0} is obsolete")]
    BadVersion(Integer),

    #[error("block timestamp {time} is not after median time past {median_time_past}")]
    TimeTooOld { time: Natural, median_time_past: Natural },

    #[error("block timestamp {time} is too far in the future (limit {limit})")]
    TimeTooNew { time: Natural, limit: Natural },

    #[error("incorrect difficulty: expected bits {expected:#x}, got {actual:#x}")]
    BadDiffBits { expected: Natural, actual: Natural },

    #[error("proof of work does not meet the claimed target")]
    HighHash,

    #[error("block timestamp {time} is not aligned to the {spacing}s slot")]
    BadTimestampSlot { time: Natural, spacing: Natural },

    #[error("block signature is missing or invalid: {0}")]
    BadBlockSignature(String),

    #[error("previous block is invalid")]
    BadPrevBlock,

    // integrity rules
    #[error("delivered header hash {actual} does not match advertised {expected}")]
    BlockHashMismatch { expected: String, actual: String },

    #[error("merkle root mismatch")]
    BadMerkleRoot,

    #[error("duplicate transaction in merkle tree")]
    MerkleMutated,

    #[error("delivered block carries a different header signature")]
    SignatureMismatch,

    // partial validation rules
    #[error("block size limits failed: {0}")]
    BadBlockLength(String),

    #[error("first transaction is not a coinbase")]
    CoinbaseMissing,

    #[error("more than one coinbase")]
    CoinbaseMultiple,

    #[error("coinbase does not commit to block height {0}")]
    BadCoinbaseHeight(Natural),

    #[error("coinbase script length out of range")]
    BadCoinbaseLength,

    #[error("duplicate transaction")]
    DuplicateTransaction,

    #[error("too many signature operations: {count}")]
    TooManySigops { count: usize },

    #[error("transaction at index {0} is not final")]
    NonFinalTransaction(usize),

    #[error("transaction has no inputs")]
    EmptyInputs,

    #[error("transaction has no outputs")]
    EmptyOutputs,

    #[error("transaction size {0} exceeds limit")]
    Oversize(usize),

    #[error("output {index} has negative value {value}")]
    NegativeOutput { index: usize, value: Integer },

    #[error("output {index} value {value} exceeds maximum money")]
    OutputTooLarge { index: usize, value: Integer },

    #[error("total output value out of range")]
    OutputTotalTooLarge,

    #[error("transaction spends the same input twice")]
    DuplicateInputs,

    #[error("non-coinbase transaction has a null prevout")]
    NullPrevout,

    // coinview rules
    #[error("input {input} of transaction {txid} is missing or spent")]
    InputsMissingOrSpent { txid: String, input: usize },

    #[error("coinbase created at height {coin_height} spent at height {spend_height}, needs depth {maturity}")]
    PrematureCoinbaseSpend { coin_height: Natural, spend_height: Natural, maturity: Natural },

    #[error("input values out of range")]
    InputValuesOutOfRange,

    #[error("value in ({value_in}) below value out ({value_out})")]
    InBelowOut { value_in: Integer, value_out: Integer },

    #[error("accumulated fees out of range")]
    FeeOutOfRange,

    #[error("coinbase pays too much (actual {actual}, limit {limit})")]
    BadCoinbaseAmount { actual: Integer, limit: Integer },

    #[error("script verification failed for transaction {txid} input {input}")]
    ScriptVerifyFailed { txid: String, input: usize },

    // chain selection
    #[error("reorganization of depth {depth} exceeds the maximum of {max}")]
    ReorgTooDeep { depth: Natural, max: Natural },
}

impl ConsensusError {
    /// Stable reject code
    pub fn code(&self) -> &'static str {
        match self {
            ConsensusError::BadVersion(_) => "bad-version",
            ConsensusError::TimeTooOld { .. } => "time-too-old",
            ConsensusError::TimeTooNew { .. } => "time-too-new",
            ConsensusError::BadDiffBits { .. } => "bad-diffbits",
            ConsensusError::HighHash => "high-hash",
            ConsensusError::BadTimestampSlot { .. } => "bad-timestamp-slot",
            ConsensusError::BadBlockSignature(_) => "bad-block-signature",
            ConsensusError::BadPrevBlock => "bad-prevblk",
            ConsensusError::BlockHashMismatch { .. } => "bad-blk-hash-mismatch",
            ConsensusError::BadMerkleRoot => "bad-txnmrklroot",
            ConsensusError::MerkleMutated => "bad-txns-duplicate",
            ConsensusError::SignatureMismatch => "bad-blk-sig-mismatch",
            ConsensusError::BadBlockLength(_) => "bad-blk-length",
            ConsensusError::CoinbaseMissing => "bad-cb-missing",
            ConsensusError::CoinbaseMultiple => "bad-cb-multiple",
            ConsensusError::BadCoinbaseHeight(_) => "bad-cb-height",
            ConsensusError::BadCoinbaseLength => "bad-cb-length",
            ConsensusError::DuplicateTransaction => "bad-txns-duplicate",
            ConsensusError::TooManySigops { .. } => "bad-blk-sigops",
            ConsensusError::NonFinalTransaction(_) => "bad-txns-nonfinal",
            ConsensusError::EmptyInputs => "bad-txns-vin-empty",
            ConsensusError::EmptyOutputs => "bad-txns-vout-empty",
            ConsensusError::Oversize(_) => "bad-txns-oversize",
            ConsensusError::NegativeOutput { .. } => "bad-txns-vout-negative",
            ConsensusError::OutputTooLarge { .. } => "bad-txns-vout-toolarge",
            ConsensusError::OutputTotalTooLarge => "bad-txns-txouttotal-toolarge",
            ConsensusError::DuplicateInputs => "bad-txns-inputs-duplicate",
            ConsensusError::NullPrevout => "bad-txns-prevout-null",
            ConsensusError::InputsMissingOrSpent { .. } => "bad-txns-inputs-missingorspent",
            ConsensusError::PrematureCoinbaseSpend { .. } => "bad-txns-premature-spend-of-coinbase",
            ConsensusError::InputValuesOutOfRange => "bad-txns-inputvalues-outofrange",
            ConsensusError::InBelowOut { .. } => "bad-txns-in-belowout",
            ConsensusError::FeeOutOfRange => "bad-txns-fee-outofrange",
            ConsensusError::BadCoinbaseAmount { .. } => "bad-cb-amount",
            ConsensusError::ScriptVerifyFailed { .. } => "mandatory-script-verify-flag-failed",
            ConsensusError::ReorgTooDeep { .. } => "reorg-too-deep",
        }
    }

    /// Whether the failure is a property of the block itself.
    ///
    /// Timestamps too far ahead may become acceptable later, and integrity
    /// failures only prove that the delivering peer sent a mutated body.
    pub fn marks_invalid(&self) -> bool {
        !matches!(
            self,
            ConsensusError::TimeTooNew { .. }
                | ConsensusError::BlockHashMismatch { .. }
                | ConsensusError::BadMerkleRoot
                | ConsensusError::MerkleMutated
                | ConsensusError::SignatureMismatch
        )
    }

    /// Misbehavior score suggested for the peer that relayed the object.
    pub fn misbehavior_score(&self) -> Option<u32> {
        match self {
            ConsensusError::TimeTooNew { .. } => None,
            ConsensusError::ReorgTooDeep { .. } => Some(20),
            _ => Some(100),
        }
    }
}

/// Outcome of a single rule that did not pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Validation cannot decide yet (insufficient header information).
    #[error("validation deferred: {0}")]
    Deferred(String),

    #[error("validation cancelled")]
    Cancelled,
}

/// Errors that escape the consensus loop boundary.
///
/// Consensus failures are turned into rejections before they reach callers;
/// everything here is either a caller mistake or fatal to chain progress.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown parent block {}", hash_to_hex(.0))]
    UnknownParent(Hash),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("inconsistent chain state: {0}")]
    InconsistentState(String),

    #[error("chain processing halted after fatal error: {0}")]
    Halted(String),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Storage and invariant failures stop chain advancement.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::InconsistentState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
