//! Economic model: subsidy schedule, money range and reward policies

use crate::constants::*;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// GetBlockSubsidy: ℕ → ℤ
///
/// Subsidy for a block at `height` when rewards halve every `interval` blocks.
///
/// Formula: subsidy = S * 2^(-⌊h/H⌋)
/// Where:
/// - h = block height
/// - H = halving interval
/// - S = initial subsidy
pub fn get_block_subsidy(height: Natural, interval: Natural, initial_subsidy: Integer) -> Integer {
    if interval == 0 {
        return initial_subsidy;
    }
    let halvings = height / interval;

    // shifting an i64 by 64 or more is undefined; the subsidy is gone anyway
    if halvings >= 64 {
        return 0;
    }

    initial_subsidy >> halvings
}

/// MoneyRange: 0 <= value <= MAX_MONEY
pub fn money_range(value: Integer) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Sum values, failing on overflow or on any partial sum leaving the money range.
pub fn checked_money_sum<I>(values: I) -> Option<Integer>
where
    I: IntoIterator<Item = Integer>,
{
    let mut total: Integer = 0;
    for value in values {
        if !money_range(value) {
            return None;
        }
        total = total.checked_add(value)?;
        if !money_range(total) {
            return None;
        }
    }
    Some(total)
}

/// How much new money a block may create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardPolicy {
    /// Bitcoin-style geometric schedule.
    Halving { initial_subsidy: Integer, interval: Natural },
    /// Constant reward per block.
    Fixed { reward: Integer },
}

impl RewardPolicy {
    /// Subsidy for a block at `height`, fees excluded
    pub fn subsidy(&self, height: Natural) -> Integer {
        match *self {
            RewardPolicy::Halving { initial_subsidy, interval } => {
                get_block_subsidy(height, interval, initial_subsidy)
            }
            RewardPolicy::Fixed { reward } => reward,
        }
    }

    /// Upper bound on coinbase outputs: subsidy plus collected fees.
    pub fn max_coinbase_value(&self, height: Natural, fees: Integer) -> Option<Integer> {
        self.subsidy(height).checked_add(fees)
    }
}
