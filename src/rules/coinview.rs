//! Full validation against the coin set

use super::{ConsensusRule, RuleContext};
use crate::block::{apply_transaction, connect_changes};
use crate::economic::{checked_money_sum, money_range, RewardPolicy};
use crate::error::{ConsensusError, RuleError};
use crate::hashing::{hash_to_hex, txid};
use crate::script::SignaturePolicy;
use crate::transaction::{check_tx_inputs, is_coinbase, MaturityPolicy};
use crate::types::*;
use rayon::prelude::*;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Input resolution, value accounting, coinbase reward and scripts.
///
/// Reward, authorization and coinbase maturity are pluggable so that one
/// rule serves every network variant.
pub struct CoinviewRule {
    reward: RewardPolicy,
    signature: SignaturePolicy,
    maturity: MaturityPolicy,
}

/// One input whose script has to be checked
struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    coin: Coin,
}

impl CoinviewRule {
    pub fn new(reward: RewardPolicy, signature: SignaturePolicy, maturity: MaturityPolicy) -> Self {
        Self { reward, signature, maturity }
    }

    /// Verify scripts in parallel; the first failure in block order wins.
    fn verify_scripts(
        &self,
        cancel: Option<&CancellationToken>,
        block: &Block,
        checks: Vec<ScriptCheck>,
    ) -> Result<(), RuleError> {
        let results: Vec<Result<(), RuleError>> = checks
            .par_iter()
            .map(|check| {
                if cancel.map_or(false, CancellationToken::is_cancelled) {
                    return Err(RuleError::Cancelled);
                }
                let tx = &block.transactions[check.tx_index];
                self.signature.verify_input(tx, check.input_index, &check.coin).map_err(|err| {
                    debug!(input = check.input_index, %err, "script check failed");
                    RuleError::from(ConsensusError::ScriptVerifyFailed {
                        txid: hash_to_hex(&txid(tx)),
                        input: check.input_index,
                    })
                })
            })
            .collect();

        results.into_iter().collect()
    }
}

impl ConsensusRule for CoinviewRule {
    fn name(&self) -> &'static str {
        "CoinviewRule"
    }

    /// 1. Walk transactions in order against a working copy of the coins,
    ///    resolving inputs, checking maturity and summing fees
    /// 2. Bound the coinbase by subsidy plus fees
    /// 3. Check scripts unless the block is assumed valid
    /// 4. Leave the block's coin changes in the context
    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let block = ctx.block()?;
        let height = ctx.header.height;
        let mut view: UtxoSet = ctx.coins.cloned().unwrap_or_default();

        let mut created = HashSet::new();
        let mut undo = UndoSet { height, spent: Vec::new() };
        let mut fees: Integer = 0;
        let mut checks = Vec::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let id = txid(tx);
            if !is_coinbase(tx) {
                let fee = check_tx_inputs(tx, &view, height, self.maturity)?;
                fees = fees
                    .checked_add(fee)
                    .filter(|total| money_range(*total))
                    .ok_or(ConsensusError::FeeOutOfRange)?;

                if !ctx.skip_scripts {
                    for (input_index, input) in tx.inputs.iter().enumerate() {
                        if let Some(coin) = view.get(&input.prevout) {
                            checks.push(ScriptCheck { tx_index, input_index, coin: coin.clone() });
                        }
                    }
                }
            }
            apply_transaction(tx, id, height, &mut view, &mut created, &mut undo);
        }

        let coinbase_value = block
            .transactions
            .first()
            .map(|coinbase| checked_money_sum(coinbase.outputs.iter().map(|output| output.value)))
            .unwrap_or(Some(0))
            .ok_or(ConsensusError::OutputTotalTooLarge)?;
        let limit = self
            .reward
            .max_coinbase_value(height, fees)
            .ok_or(ConsensusError::FeeOutOfRange)?;
        if coinbase_value > limit {
            return Err(ConsensusError::BadCoinbaseAmount { actual: coinbase_value, limit }.into());
        }

        if !checks.is_empty() {
            self.verify_scripts(ctx.cancel, block, checks)?;
        }

        ctx.fees = fees;
        ctx.coin_changes = Some(connect_changes(ctx.header.hash, block, undo));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::chain_index::ChainIndex;
    use crate::constants::*;
    use crate::context::ConsensusContext;
    use crate::script::{p2pkh_script, push_data};
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn rule() -> CoinviewRule {
        CoinviewRule::new(
            RewardPolicy::Halving { initial_subsidy: INITIAL_SUBSIDY, interval: 150 },
            SignaturePolicy::Script,
            MaturityPolicy::CoinbaseDepth(100),
        )
    }

    fn spend(prevout: OutPoint, value: Integer) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout, script_sig: vec![], sequence: SEQUENCE_FINAL }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn coin(value: Integer, height: Natural, is_coinbase: bool) -> Coin {
        Coin { value, script_pubkey: vec![0x51], height, is_coinbase }
    }

    fn run(
        rule: &CoinviewRule,
        consensus: &ConsensusContext,
        index: &ChainIndex,
        block: &Block,
        coins: &UtxoSet,
    ) -> Result<CoinChanges, RuleError> {
        let node = index.prepare(block.header.clone()).unwrap();
        let mut ctx = RuleContext::new(consensus, index, &node).with_block(block).with_coins(coins);
        rule.run(&mut ctx)?;
        Ok(ctx.coin_changes.expect("changes produced"))
    }

    fn code(result: Result<CoinChanges, RuleError>) -> &'static str {
        match result {
            Err(RuleError::Consensus(err)) => err.code(),
            other => panic!("expected a consensus failure, got {other:?}"),
        }
    }

    #[test]
    fn test_changes_and_fees() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), coin(10_000, 0, false));

        let block = block_on(index.tip(), vec![coinbase(1, INITIAL_SUBSIDY + 1_000), spend(prevout.clone(), 9_000)]);
        let changes = run(&rule(), &consensus, &index, &block, &coins).unwrap();

        assert_eq!(changes.spent, vec![prevout.clone()]);
        assert_eq!(changes.created.len(), 2);
        match changes.undo {
            UndoUpdate::Record { undo, .. } => assert_eq!(undo.spent, vec![(prevout, coin(10_000, 0, false))]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_coinbase_over_reward() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let block = block_on(index.tip(), vec![coinbase(1, INITIAL_SUBSIDY + 1)]);
        assert_eq!(code(run(&rule(), &consensus, &index, &block, &UtxoSet::new())), "bad-cb-amount");
    }

    #[test]
    fn test_in_block_double_spend() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), coin(10_000, 0, false));

        let block = block_on(
            index.tip(),
            vec![coinbase(1, 1), spend(prevout.clone(), 9_000), spend(prevout, 8_000)],
        );
        assert_eq!(
            code(run(&rule(), &consensus, &index, &block, &coins)),
            "bad-txns-inputs-missingorspent"
        );
    }

    #[test]
    fn test_spend_of_output_created_in_same_block() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), coin(10_000, 0, false));

        let parent = spend(prevout, 9_000);
        let child = spend(OutPoint::new(txid(&parent), 0), 8_000);
        let block = block_on(index.tip(), vec![coinbase(1, 1), parent, child]);
        let changes = run(&rule(), &consensus, &index, &block, &coins).unwrap();
        assert_eq!(changes.spent.len(), 1);
        assert_eq!(changes.created.len(), 2);
    }

    #[test]
    fn test_immature_coinbase_spend() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), coin(10_000, 0, true));

        let block = block_on(index.tip(), vec![coinbase(1, 1), spend(prevout, 9_000)]);
        assert_eq!(
            code(run(&rule(), &consensus, &index, &block, &coins)),
            "bad-txns-premature-spend-of-coinbase"
        );
    }

    #[test]
    fn test_first_failing_script_in_block_order() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut coins = UtxoSet::new();
        let mut txs = vec![coinbase(1, 1)];
        for i in 0..8u8 {
            let prevout = OutPoint::new([i + 1; 32], 0);
            // odd coins are locked by OP_0 and can never be spent
            let script_pubkey = if i % 2 == 1 { vec![0x00] } else { vec![0x51] };
            coins.insert(prevout.clone(), Coin { value: 1_000, script_pubkey, height: 0, is_coinbase: false });
            txs.push(spend(prevout, 900));
        }
        let failing = hash_to_hex(&txid(&txs[2]));
        let block = block_on(index.tip(), txs);

        let result = run(&rule(), &consensus, &index, &block, &coins);
        assert_eq!(
            result.unwrap_err(),
            RuleError::Consensus(ConsensusError::ScriptVerifyFailed { txid: failing, input: 0 })
        );
    }

    #[test]
    fn test_skip_scripts_for_assumed_valid() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), Coin { value: 1_000, script_pubkey: vec![0x00], height: 0, is_coinbase: false });
        let block = block_on(index.tip(), vec![coinbase(1, 1), spend(prevout, 900)]);

        let node = index.prepare(block.header.clone()).unwrap();
        let mut ctx = RuleContext::new(&consensus, &index, &node)
            .with_block(&block)
            .with_coins(&coins)
            .skip_scripts(true);
        assert!(rule().run(&mut ctx).is_ok());
    }

    #[test]
    fn test_signed_spend() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x31; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key).serialize();
        let script_pubkey = p2pkh_script(&pubkey);

        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), Coin { value: 1_000, script_pubkey: script_pubkey.clone(), height: 0, is_coinbase: false });

        let mut tx = spend(prevout, 900);
        let digest = crate::hashing::signature_hash(&tx, 0, &script_pubkey);
        let mut sig = secp.sign_ecdsa(&Message::from_digest_slice(&digest).unwrap(), &key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        let mut script_sig = push_data(&sig);
        script_sig.extend(push_data(&pubkey));
        tx.inputs[0].script_sig = script_sig;

        let block = block_on(index.tip(), vec![coinbase(1, 1), tx]);
        assert!(run(&rule(), &consensus, &index, &block, &coins).is_ok());
    }

    #[test]
    fn test_cancelled_script_checks() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let prevout = OutPoint::new([1; 32], 0);
        let mut coins = UtxoSet::new();
        coins.insert(prevout.clone(), coin(1_000, 0, false));
        let block = block_on(index.tip(), vec![coinbase(1, 1), spend(prevout, 900)]);

        let token = CancellationToken::new();
        token.cancel();
        let node = index.prepare(block.header.clone()).unwrap();
        let mut ctx = RuleContext::new(&consensus, &index, &node)
            .with_block(&block)
            .with_coins(&coins)
            .with_cancel(&token);
        assert_eq!(rule().run(&mut ctx), Err(RuleError::Cancelled));
    }
}
