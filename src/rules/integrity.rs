//! Integrity rules: the delivered body matches the header it was requested for
//!
//! A failure here says nothing about the block itself, only about the copy a
//! peer delivered, so these errors never mark the header invalid.

use super::{ConsensusRule, RuleContext};
use crate::error::{ConsensusError, RuleError};
use crate::hashing::{block_hash, block_merkle_root, hash_to_hex};

/// Delivered header hashes to the advertised hash.
pub struct BlockHeaderHashRule;

impl ConsensusRule for BlockHeaderHashRule {
    fn name(&self) -> &'static str {
        "BlockHeaderHashRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let expected = ctx.advertised_hash.unwrap_or(ctx.header.hash);
        let actual = block_hash(&block.header);
        if actual != expected {
            return Err(ConsensusError::BlockHashMismatch {
                expected: hash_to_hex(&expected),
                actual: hash_to_hex(&actual),
            }
            .into());
        }
        Ok(())
    }
}

/// Transactions hash to the header's merkle root without duplication.
pub struct BlockMerkleRootRule;

impl ConsensusRule for BlockMerkleRootRule {
    fn name(&self) -> &'static str {
        "BlockMerkleRootRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let (root, mutated) = block_merkle_root(block);
        if root != block.header.merkle_root {
            return Err(ConsensusError::BadMerkleRoot.into());
        }
        if mutated {
            return Err(ConsensusError::MerkleMutated.into());
        }
        Ok(())
    }
}

/// The delivered header carries the signature that was validated with the
/// header; the signature is outside the hash, so it can be swapped in transit.
pub struct PoaIntegritySignatureRule;

impl ConsensusRule for PoaIntegritySignatureRule {
    fn name(&self) -> &'static str {
        "PoaIntegritySignatureRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        if block.header.signature != ctx.header.header.signature {
            return Err(ConsensusError::SignatureMismatch.into());
        }
        Ok(())
    }
}
