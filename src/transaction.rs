//! Transaction validation: context-free structure, finality and input resolution

use crate::constants::*;
use crate::economic::{checked_money_sum, money_range};
use crate::error::ConsensusError;
use crate::hashing::{transaction_size, txid, hash_to_hex};
use crate::script::sigop_count;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ max block size
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ M_max, and Σ o.value ≤ M_max
/// 4. no prevout is spent twice
/// 5. coinbase script sig is 2..=100 bytes; other inputs have non-null prevouts
pub fn check_transaction(tx: &Transaction) -> Result<(), ConsensusError> {
    // 1. Inputs and outputs are not empty
    if tx.inputs.is_empty() {
        return Err(ConsensusError::EmptyInputs);
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::EmptyOutputs);
    }

    // 2. Size limit
    let size = transaction_size(tx);
    if size > MAX_BLOCK_SIZE {
        return Err(ConsensusError::Oversize(size));
    }

    // 3. Output values
    let mut total: Integer = 0;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(ConsensusError::NegativeOutput { index, value: output.value });
        }
        if output.value > MAX_MONEY {
            return Err(ConsensusError::OutputTooLarge { index, value: output.value });
        }
        total = total
            .checked_add(output.value)
            .filter(|sum| money_range(*sum))
            .ok_or(ConsensusError::OutputTotalTooLarge)?;
    }

    // 4. Duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    if !tx.inputs.iter().all(|input| seen.insert(&input.prevout)) {
        return Err(ConsensusError::DuplicateInputs);
    }

    // 5. Coinbase shape / null prevouts
    if is_coinbase(tx) {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ConsensusError::BadCoinbaseLength);
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::NullPrevout);
    }

    Ok(())
}

/// Exactly one input, spending the null prevout
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.len() == 1 && tx.inputs[0].prevout.is_null()
}

/// IsFinalTx: lock time already passed at `height`/`time`, or every input
/// opted out with a final sequence.
pub fn is_final(tx: &Transaction, height: Natural, time: Natural) -> bool {
    if tx.lock_time == 0 {
        return true;
    }

    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { time };
    if tx.lock_time < threshold {
        return true;
    }

    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Opt-in replaceability: some input has sequence <= 0xfffffffd
pub fn signals_rbf(tx: &Transaction) -> bool {
    tx.inputs.iter().any(|input| input.sequence <= SEQUENCE_RBF)
}

/// Legacy sigops of all scripts in the transaction
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx.inputs.iter().map(|input| sigop_count(&input.script_sig)).sum();
    let outputs: usize = tx.outputs.iter().map(|output| sigop_count(&output.script_pubkey)).sum();
    inputs + outputs
}

/// When coinbase outputs become spendable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaturityPolicy {
    /// Coinbase outputs need this many blocks on top of their own.
    CoinbaseDepth(Natural),
    /// Everything is spendable at once.
    Immediate,
}

impl MaturityPolicy {
    pub fn depth(&self) -> Natural {
        match self {
            MaturityPolicy::CoinbaseDepth(depth) => *depth,
            MaturityPolicy::Immediate => 0,
        }
    }

    /// spend_height - coin.height >= depth for coinbase coins
    pub fn check(&self, coin: &Coin, spend_height: Natural) -> Result<(), ConsensusError> {
        let maturity = self.depth();
        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < maturity {
            return Err(ConsensusError::PrematureCoinbaseSpend {
                coin_height: coin.height,
                spend_height,
                maturity,
            });
        }
        Ok(())
    }
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → ℤ
///
/// For transaction tx spending from coins us at height h:
/// 1. Every prevout must resolve in us
/// 2. Coinbase coins must be mature
/// 3. Σ inputs stays in the money range (checked before comparing)
/// 4. Σ inputs ≥ Σ outputs
/// 5. Return the fee Σ inputs - Σ outputs
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &UtxoSet,
    spend_height: Natural,
    maturity: MaturityPolicy,
) -> Result<Integer, ConsensusError> {
    if is_coinbase(tx) {
        return Ok(0);
    }

    let mut values = Vec::with_capacity(tx.inputs.len());
    for (input_index, input) in tx.inputs.iter().enumerate() {
        let coin = coins.get(&input.prevout).ok_or_else(|| ConsensusError::InputsMissingOrSpent {
            txid: hash_to_hex(&txid(tx)),
            input: input_index,
        })?;
        maturity.check(coin, spend_height)?;
        values.push(coin.value);
    }

    let value_in = checked_money_sum(values).ok_or(ConsensusError::InputValuesOutOfRange)?;
    let value_out = checked_money_sum(tx.outputs.iter().map(|output| output.value))
        .ok_or(ConsensusError::OutputTotalTooLarge)?;

    if value_in < value_out {
        return Err(ConsensusError::InBelowOut { value_in, value_out });
    }

    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ConsensusError::FeeOutOfRange);
    }
    Ok(fee)
}
