//! Proof of work: compact targets, work per block and difficulty retargeting

use crate::chain_index::{ChainIndex, ChainedHeader};
use crate::context::ConsensusParams;
use crate::types::*;
use primitive_types::U256;

/// Expand a compact target.
///
/// The format is `0x1d00ffff` where `0x1d` is the size in bytes and
/// `0x00ffff` the mantissa: target = mantissa * 256^(size - 3).
/// Returns `None` for negative or overflowing encodings.
pub fn expand_target(bits: Natural) -> Option<U256> {
    let size = (bits >> 24) as u32;
    let word = bits & 0x007fffff;

    if word != 0 && (bits & 0x00800000) != 0 {
        return None;
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return None;
    }

    let target = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };
    Some(target)
}

/// Compress a target into its compact form
pub fn compact_target(target: U256) -> Natural {
    let mut size = ((target.bits() + 7) / 8) as u64;
    let mut compact = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3)) as usize).low_u64()
    };

    // the mantissa's sign bit must stay clear
    if compact & 0x00800000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

/// CheckProofOfWork: the header hash, read as a little-endian number, must not
/// exceed the target its bits claim, and that target must be within the limit.
pub fn check_proof_of_work(hash: &Hash, bits: Natural, pow_limit_bits: Natural) -> bool {
    let (target, limit) = match (expand_target(bits), expand_target(pow_limit_bits)) {
        (Some(target), Some(limit)) => (target, limit),
        _ => return false,
    };
    if target.is_zero() || target > limit {
        return false;
    }
    U256::from_little_endian(hash) <= target
}

/// Expected number of hashes needed to meet `bits`: 2^256 / (target + 1)
pub fn block_work(bits: Natural) -> U256 {
    match expand_target(bits) {
        Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// GetNextWorkRequired: target the child of `prev` must carry.
///
/// Outside adjustment boundaries the parent's target is kept. At a boundary
/// the target scales by the actual timespan of the last interval, clamped to
/// a factor of four either way, and capped at the proof-of-work limit.
pub fn next_work_required(index: &ChainIndex, prev: &ChainedHeader, params: &ConsensusParams) -> Natural {
    if params.no_retargeting {
        return prev.header.bits;
    }

    let interval = params.difficulty_adjustment_interval;
    if (prev.height + 1) % interval != 0 {
        return prev.header.bits;
    }

    let first_height = prev.height + 1 - interval;
    let first = match index.ancestor(&prev.hash, first_height) {
        Some(first) => first,
        None => return prev.header.bits,
    };

    let target_timespan = interval * params.target_spacing;
    let actual = prev
        .header
        .timestamp
        .saturating_sub(first.header.timestamp)
        .clamp(target_timespan / 4, target_timespan * 4);

    let limit = expand_target(params.pow_limit_bits).unwrap_or_else(U256::max_value);
    let old_target = match expand_target(prev.header.bits) {
        Some(target) => target,
        None => return params.pow_limit_bits,
    };

    let (scaled, overflow) = old_target.overflowing_mul(U256::from(actual));
    let new_target = if overflow { limit } else { (scaled / U256::from(target_timespan)).min(limit) };

    compact_target(new_target)
}
