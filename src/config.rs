//! Node-level configuration consumed by the consensus core
//!
//! Values are read once at startup; there is no hot reload.

use crate::constants::*;
use crate::error::Error;
use crate::types::Hash;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Deepest reorganization followed; also the undo retention window.
    pub max_reorg_depth: u64,
    /// Allowed header timestamp drift ahead of the local clock.
    pub max_future_drift_secs: u64,
    /// Blocks at or below this hash skip script verification.
    pub assume_valid: Option<Hash>,
    pub coin_cache: CoinCacheConfig,
    pub mempool: MempoolConfig,
    pub propagation: PropagationConfig,
    /// Capacity of the inbound command queue of the async service.
    pub inbound_queue_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            max_future_drift_secs: DEFAULT_MAX_FUTURE_DRIFT_SECS,
            assume_valid: None,
            coin_cache: CoinCacheConfig::default(),
            mempool: MempoolConfig::default(),
            propagation: PropagationConfig::default(),
            inbound_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinCacheConfig {
    pub max_items: usize,
    /// Dirty entries accumulated before the cache writes back.
    pub flush_threshold: usize,
}

impl Default for CoinCacheConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_COIN_CACHE_MAX_ITEMS,
            flush_threshold: DEFAULT_COIN_CACHE_FLUSH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Base units per 1000 bytes.
    pub min_relay_fee_rate: u64,
    /// Base units per 1000 bytes.
    pub dust_relay_fee_rate: u64,
    pub max_size_bytes: usize,
    pub expiry_secs: u64,
    pub ancestor_limit: u64,
    pub ancestor_size_limit: u64,
    pub descendant_limit: u64,
    pub descendant_size_limit: u64,
    pub max_standard_tx_size: usize,
    pub require_standard: bool,
    pub replace_by_fee: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            min_relay_fee_rate: DEFAULT_MIN_RELAY_FEE_RATE,
            dust_relay_fee_rate: DEFAULT_DUST_RELAY_FEE_RATE,
            max_size_bytes: DEFAULT_MEMPOOL_MAX_SIZE,
            expiry_secs: DEFAULT_MEMPOOL_EXPIRY_SECS,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit: DEFAULT_ANCESTOR_SIZE_LIMIT,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit: DEFAULT_DESCENDANT_SIZE_LIMIT,
            max_standard_tx_size: MAX_STANDARD_TX_SIZE,
            require_standard: true,
            replace_by_fee: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub poll_interval_ms: u64,
    pub deadline_ms: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 500, deadline_ms: 60_000 }
    }
}

impl ConsensusConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: ConsensusConfig =
            serde_json::from_str(json).context("failed to parse consensus configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_reorg_depth == 0 {
            return Err(Error::Config("max_reorg_depth must be positive".to_string()));
        }
        if self.coin_cache.max_items == 0 {
            return Err(Error::Config("coin_cache.max_items must be positive".to_string()));
        }
        if self.mempool.ancestor_limit == 0 || self.mempool.descendant_limit == 0 {
            return Err(Error::Config("mempool chain limits must be positive".to_string()));
        }
        if self.propagation.poll_interval_ms == 0 {
            return Err(Error::Config("propagation.poll_interval_ms must be positive".to_string()));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(Error::Config("inbound_queue_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ConsensusConfig::from_json(r#"{ "max_reorg_depth": 10, "mempool": { "replace_by_fee": true } }"#)
            .unwrap();
        assert_eq!(config.max_reorg_depth, 10);
        assert!(config.mempool.replace_by_fee);
        assert_eq!(config.mempool.min_relay_fee_rate, DEFAULT_MIN_RELAY_FEE_RATE);
        assert_eq!(config.max_future_drift_secs, DEFAULT_MAX_FUTURE_DRIFT_SECS);
    }

    #[test]
    fn test_zero_reorg_depth_rejected() {
        assert!(ConsensusConfig::from_json(r#"{ "max_reorg_depth": 0 }"#).is_err());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = ConsensusConfig::from_json_file("/nonexistent/consensus.json").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }
}
