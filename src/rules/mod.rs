//! Consensus rule engine
//!
//! Validation is split into four ordered stages:
//!
//! 1. **header**: the header alone, in the context of its parent
//! 2. **integrity**: the delivered body really belongs to the header
//! 3. **partial**: context-free body rules
//! 4. **full**: rules that need the coin set (run when connecting)
//!
//! Each stage is a list of [`ConsensusRule`]s assembled once per network by
//! [`RuleEngine::for_params`]. Rules read the [`RuleContext`] and never touch
//! the chain index or coin view; the only output they produce is the block's
//! [`CoinChanges`], left in the context by the full stage.

pub mod coinview;
pub mod header;
pub mod integrity;
pub mod partial;

use crate::chain_index::{ChainIndex, ChainedHeader};
use crate::context::{ConsensusContext, ConsensusVariant};
use crate::error::RuleError;
use crate::types::*;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::coinview::CoinviewRule;
pub use self::header::{
    CheckDifficultyRule, FederationSignatureRule, FixedTargetRule, HeaderTimeRule, HeaderVersionRule,
    PoaTimestampSlotRule,
};
pub use self::integrity::{BlockHeaderHashRule, BlockMerkleRootRule, PoaIntegritySignatureRule};
pub use self::partial::{
    BlockSizeRule, CoinbaseHeightRule, EnsureCoinbaseRule, FinalTransactionRule, SigOpsLimitRule,
    TransactionDuplicationRule, TransactionStructureRule,
};

/// A single consensus check.
pub trait ConsensusRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError>;
}

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    pub consensus: &'a ConsensusContext,
    pub index: &'a ChainIndex,
    /// The header under validation; during header validation it is not in
    /// the index yet, but its parent is.
    pub header: &'a ChainedHeader,
    pub block: Option<&'a Block>,
    /// Hash the body was requested under.
    pub advertised_hash: Option<Hash>,
    /// Coins spent by the block, prefetched by the caller.
    pub coins: Option<&'a UtxoSet>,
    /// Block lies under the assume-valid point: scripts are not checked.
    pub skip_scripts: bool,
    pub cancel: Option<&'a CancellationToken>,
    /// Output of the full stage.
    pub coin_changes: Option<CoinChanges>,
    pub fees: Integer,
}

impl<'a> RuleContext<'a> {
    pub fn new(consensus: &'a ConsensusContext, index: &'a ChainIndex, header: &'a ChainedHeader) -> Self {
        Self {
            consensus,
            index,
            header,
            block: None,
            advertised_hash: None,
            coins: None,
            skip_scripts: false,
            cancel: None,
            coin_changes: None,
            fees: 0,
        }
    }

    pub fn with_block(mut self, block: &'a Block) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_advertised_hash(mut self, hash: Hash) -> Self {
        self.advertised_hash = Some(hash);
        self
    }

    pub fn with_coins(mut self, coins: &'a UtxoSet) -> Self {
        self.coins = Some(coins);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn skip_scripts(mut self, skip: bool) -> Self {
        self.skip_scripts = skip;
        self
    }

    /// Parent of the header under validation
    pub fn parent(&self) -> Result<&'a ChainedHeader, RuleError> {
        self.header
            .previous
            .as_ref()
            .and_then(|previous| self.index.get_header(previous))
            .ok_or_else(|| RuleError::Deferred("parent header is not indexed".to_string()))
    }

    pub fn block(&self) -> Result<&'a Block, RuleError> {
        self.block
            .ok_or_else(|| RuleError::Deferred("block body is not available".to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.map_or(false, CancellationToken::is_cancelled)
    }
}

/// Ordered rule lists per validation stage
#[derive(Default)]
pub struct RuleEngine {
    pub header: Vec<Box<dyn ConsensusRule>>,
    pub integrity: Vec<Box<dyn ConsensusRule>>,
    pub partial: Vec<Box<dyn ConsensusRule>>,
    pub full: Vec<Box<dyn ConsensusRule>>,
}

impl RuleEngine {
    /// Pipeline for the network described by `consensus`
    pub fn for_params(consensus: &ConsensusContext) -> Self {
        let params = &consensus.params;

        let mut header: Vec<Box<dyn ConsensusRule>> =
            vec![Box::new(HeaderVersionRule), Box::new(HeaderTimeRule)];
        let mut integrity: Vec<Box<dyn ConsensusRule>> =
            vec![Box::new(BlockHeaderHashRule), Box::new(BlockMerkleRootRule)];

        match &params.variant {
            ConsensusVariant::ProofOfWork => {
                header.push(Box::new(CheckDifficultyRule));
            }
            ConsensusVariant::ProofOfAuthority { target_spacing, federation } => {
                header.push(Box::new(FixedTargetRule));
                header.push(Box::new(PoaTimestampSlotRule::new(*target_spacing)));
                header.push(Box::new(FederationSignatureRule::new(federation.clone())));
                integrity.push(Box::new(PoaIntegritySignatureRule));
            }
        }

        let partial: Vec<Box<dyn ConsensusRule>> = vec![
            Box::new(BlockSizeRule),
            Box::new(EnsureCoinbaseRule),
            Box::new(TransactionStructureRule),
            Box::new(TransactionDuplicationRule),
            Box::new(FinalTransactionRule),
            Box::new(CoinbaseHeightRule),
            Box::new(SigOpsLimitRule),
        ];

        let full: Vec<Box<dyn ConsensusRule>> =
            vec![Box::new(CoinviewRule::new(params.reward, params.signature, params.maturity))];

        Self { header, integrity, partial, full }
    }

    pub fn validate_header(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        run_stage("header", &self.header, ctx)
    }

    pub fn validate_integrity(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        run_stage("integrity", &self.integrity, ctx)
    }

    pub fn validate_partial(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        run_stage("partial", &self.partial, ctx)
    }

    pub fn validate_full(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        run_stage("full", &self.full, ctx)
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.header
            .iter()
            .chain(&self.integrity)
            .chain(&self.partial)
            .chain(&self.full)
            .map(|rule| rule.name())
            .collect()
    }
}

/// Run `rules` in order, stopping at the first failure.
fn run_stage(stage: &str, rules: &[Box<dyn ConsensusRule>], ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    for rule in rules {
        if ctx.is_cancelled() {
            return Err(RuleError::Cancelled);
        }
        if let Err(err) = rule.run(ctx) {
            debug!(stage, rule = rule.name(), height = ctx.header.height, %err, "rule failed");
            return Err(err);
        }
    }
    debug!(stage, height = ctx.header.height, "stage passed");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Small fixtures shared by the rule tests

    use super::*;
    use crate::block::coinbase_height_prefix;
    use crate::config::ConsensusConfig;
    use crate::constants::*;
    use crate::context::{ConsensusParams, ManualClock};
    use crate::hashing::block_merkle_root;
    use std::sync::Arc;

    pub const GENESIS_TIME: Natural = 1_600_000_000;

    pub fn regtest_context() -> ConsensusContext {
        ConsensusContext::new(
            ConsensusParams::regtest(GENESIS_TIME),
            ConsensusConfig::default(),
            Arc::new(ManualClock::new(GENESIS_TIME + 10_000)),
        )
    }

    pub fn coinbase(height: Natural, value: Integer) -> Transaction {
        let mut script_sig = coinbase_height_prefix(height);
        script_sig.push(0x00);
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    /// Block on top of `parent` with a correct merkle root; not mined.
    pub fn block_on(parent: &ChainedHeader, transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: parent.hash,
                merkle_root: [0; 32],
                timestamp: parent.header.timestamp + 600,
                bits: parent.header.bits,
                nonce: 0,
                signature: None,
            },
            transactions,
        };
        block.header.merkle_root = block_merkle_root(&block).0;
        block
    }

    /// Grind the nonce until the regtest target is met.
    pub fn mine(block: &mut Block) {
        while !crate::pow::check_proof_of_work(
            &crate::hashing::block_hash(&block.header),
            block.header.bits,
            REGTEST_POW_LIMIT_BITS,
        ) {
            block.header.nonce += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_pow_pipeline_order() {
        let engine = RuleEngine::for_params(&regtest_context());
        assert_eq!(
            engine.rule_names(),
            vec![
                "HeaderVersionRule",
                "HeaderTimeRule",
                "CheckDifficultyRule",
                "BlockHeaderHashRule",
                "BlockMerkleRootRule",
                "BlockSizeRule",
                "EnsureCoinbaseRule",
                "TransactionStructureRule",
                "TransactionDuplicationRule",
                "FinalTransactionRule",
                "CoinbaseHeightRule",
                "SigOpsLimitRule",
                "CoinviewRule",
            ]
        );
    }

    #[test]
    fn test_cancelled_stage_stops_before_rules() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let engine = RuleEngine::for_params(&consensus);
        let token = CancellationToken::new();
        token.cancel();

        let node = index.genesis().clone();
        let mut ctx = RuleContext::new(&consensus, &index, &node).with_cancel(&token);
        assert_eq!(engine.validate_header(&mut ctx), Err(RuleError::Cancelled));
    }
}
