//! Partial validation: body rules that need no coins

use super::{ConsensusRule, RuleContext};
use crate::block::{block_sigop_count, coinbase_commits_height};
use crate::constants::*;
use crate::error::{ConsensusError, RuleError};
use crate::hashing::{block_size, txid};
use crate::transaction::{check_transaction, is_coinbase, is_final};
use std::collections::HashSet;

/// At least one transaction and within the size limit.
pub struct BlockSizeRule;

impl ConsensusRule for BlockSizeRule {
    fn name(&self) -> &'static str {
        "BlockSizeRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        if block.transactions.is_empty() {
            return Err(ConsensusError::BadBlockLength("block has no transactions".to_string()).into());
        }
        let size = block_size(block);
        if size > MAX_BLOCK_SIZE {
            return Err(ConsensusError::BadBlockLength(format!("{size} bytes exceeds {MAX_BLOCK_SIZE}")).into());
        }
        Ok(())
    }
}

/// First transaction is the only coinbase.
pub struct EnsureCoinbaseRule;

impl ConsensusRule for EnsureCoinbaseRule {
    fn name(&self) -> &'static str {
        "EnsureCoinbaseRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        match block.transactions.first() {
            Some(first) if is_coinbase(first) => {}
            _ => return Err(ConsensusError::CoinbaseMissing.into()),
        }
        if block.transactions.iter().skip(1).any(is_coinbase) {
            return Err(ConsensusError::CoinbaseMultiple.into());
        }
        Ok(())
    }
}

/// Every transaction passes the context-free checks.
pub struct TransactionStructureRule;

impl ConsensusRule for TransactionStructureRule {
    fn name(&self) -> &'static str {
        "TransactionStructureRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        for tx in &ctx.block()?.transactions {
            check_transaction(tx)?;
        }
        Ok(())
    }
}

/// No transaction appears twice.
pub struct TransactionDuplicationRule;

impl ConsensusRule for TransactionDuplicationRule {
    fn name(&self) -> &'static str {
        "TransactionDuplicationRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let mut seen = HashSet::with_capacity(block.transactions.len());
        if !block.transactions.iter().all(|tx| seen.insert(txid(tx))) {
            return Err(ConsensusError::DuplicateTransaction.into());
        }
        Ok(())
    }
}

/// Lock times are satisfied at the block's height and the parent's median
/// time past.
pub struct FinalTransactionRule;

impl ConsensusRule for FinalTransactionRule {
    fn name(&self) -> &'static str {
        "FinalTransactionRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let parent = ctx.parent()?;
        let cutoff = ctx.index.median_time_past(&parent.hash);
        let height = ctx.header.height;

        for (index, tx) in block.transactions.iter().enumerate() {
            if !is_final(tx, height, cutoff) {
                return Err(ConsensusError::NonFinalTransaction(index).into());
            }
        }
        Ok(())
    }
}

/// Coinbase script starts with the block height.
pub struct CoinbaseHeightRule;

impl ConsensusRule for CoinbaseHeightRule {
    fn name(&self) -> &'static str {
        "CoinbaseHeightRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let height = ctx.header.height;
        match block.transactions.first() {
            Some(coinbase) if coinbase_commits_height(coinbase, height) => Ok(()),
            _ => Err(ConsensusError::BadCoinbaseHeight(height).into()),
        }
    }
}

pub struct SigOpsLimitRule;

impl ConsensusRule for SigOpsLimitRule {
    fn name(&self) -> &'static str {
        "SigOpsLimitRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let count = block_sigop_count(ctx.block()?);
        if count > MAX_BLOCK_SIGOPS {
            return Err(ConsensusError::TooManySigops { count }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::chain_index::ChainIndex;
    use crate::context::ConsensusContext;
    use crate::types::*;

    fn run(rule: &dyn ConsensusRule, consensus: &ConsensusContext, index: &ChainIndex, block: &Block) -> Result<(), RuleError> {
        let node = index.prepare(block.header.clone()).unwrap();
        let mut ctx = RuleContext::new(consensus, index, &node).with_block(block);
        rule.run(&mut ctx)
    }

    fn spend(lock_time: Natural, sequence: Natural) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: OutPoint::new([1; 32], 0), script_sig: vec![], sequence }],
            outputs: vec![TransactionOutput { value: 1, script_pubkey: vec![0x51] }],
            lock_time,
        }
    }

    fn code(result: Result<(), RuleError>) -> &'static str {
        match result {
            Err(RuleError::Consensus(err)) => err.code(),
            other => panic!("expected a consensus failure, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_block_passes_all_partial_rules() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let block = block_on(index.tip(), vec![coinbase(1, 1), spend(0, SEQUENCE_FINAL)]);
        let engine = super::super::RuleEngine::for_params(&consensus);
        let node = index.prepare(block.header.clone()).unwrap();
        let mut ctx = RuleContext::new(&consensus, &index, &node).with_block(&block);
        assert!(engine.validate_partial(&mut ctx).is_ok());
    }

    #[test]
    fn test_empty_block() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let block = block_on(index.tip(), vec![]);
        assert_eq!(code(run(&BlockSizeRule, &consensus, &index, &block)), "bad-blk-length");
    }

    #[test]
    fn test_coinbase_placement() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());

        let missing = block_on(index.tip(), vec![spend(0, SEQUENCE_FINAL)]);
        assert_eq!(code(run(&EnsureCoinbaseRule, &consensus, &index, &missing)), "bad-cb-missing");

        let double = block_on(index.tip(), vec![coinbase(1, 1), coinbase(1, 2)]);
        assert_eq!(code(run(&EnsureCoinbaseRule, &consensus, &index, &double)), "bad-cb-multiple");
    }

    #[test]
    fn test_duplicate_transaction() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let tx = spend(0, SEQUENCE_FINAL);
        let block = block_on(index.tip(), vec![coinbase(1, 1), tx.clone(), tx]);
        assert_eq!(code(run(&TransactionDuplicationRule, &consensus, &index, &block)), "bad-txns-duplicate");
    }

    #[test]
    fn test_non_final_transaction() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let block = block_on(index.tip(), vec![coinbase(1, 1), spend(5, 0)]);
        assert_eq!(
            run(&FinalTransactionRule, &consensus, &index, &block),
            Err(ConsensusError::NonFinalTransaction(1).into())
        );
    }

    #[test]
    fn test_coinbase_height() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let wrong = block_on(index.tip(), vec![coinbase(2, 1)]);
        assert_eq!(code(run(&CoinbaseHeightRule, &consensus, &index, &wrong)), "bad-cb-height");
    }

    #[test]
    fn test_sigops_limit() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut heavy = spend(0, SEQUENCE_FINAL);
        heavy.outputs[0].script_pubkey = vec![OP_CHECKMULTISIG; 1001];
        let block = block_on(index.tip(), vec![coinbase(1, 1), heavy]);
        assert_eq!(code(run(&SigOpsLimitRule, &consensus, &index, &block)), "bad-blk-sigops");
    }
}
