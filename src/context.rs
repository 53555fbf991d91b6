//! Consensus parameters and the process-wide consensus context
//!
//! Everything the rules need to know about the network travels in one
//! [`ConsensusContext`], created at startup and passed explicitly.

use crate::config::ConsensusConfig;
use crate::constants::*;
use crate::economic::RewardPolicy;
use crate::script::SignaturePolicy;
use crate::transaction::MaturityPolicy;
use crate::types::*;
use secp256k1::PublicKey;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of federation membership for proof-of-authority networks.
pub trait FederationProvider: Send + Sync {
    /// Members allowed to sign the block at `height`, or `None` when the
    /// membership for that height is not known yet.
    fn federation_at(&self, height: Natural) -> Option<Vec<PublicKey>>;
}

/// A federation that never changes.
#[derive(Debug, Clone)]
pub struct StaticFederation {
    members: Vec<PublicKey>,
}

impl StaticFederation {
    pub fn new(members: Vec<PublicKey>) -> Self {
        Self { members }
    }
}

impl FederationProvider for StaticFederation {
    fn federation_at(&self, _height: Natural) -> Option<Vec<PublicKey>> {
        Some(self.members.clone())
    }
}

#[derive(Clone)]
pub enum ConsensusVariant {
    ProofOfWork,
    ProofOfAuthority {
        /// Blocks are produced on fixed slots of this many seconds.
        target_spacing: Natural,
        federation: Arc<dyn FederationProvider>,
    },
}

impl fmt::Debug for ConsensusVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusVariant::ProofOfWork => write!(f, "ProofOfWork"),
            ConsensusVariant::ProofOfAuthority { target_spacing, .. } => f
                .debug_struct("ProofOfAuthority")
                .field("target_spacing", target_spacing)
                .finish_non_exhaustive(),
        }
    }
}

/// Protocol parameters of one network.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub variant: ConsensusVariant,
    pub genesis: BlockHeader,
    pub pow_limit_bits: Natural,
    /// Keep the parent's target instead of retargeting (test networks).
    pub no_retargeting: bool,
    pub difficulty_adjustment_interval: Natural,
    pub target_spacing: Natural,
    pub min_block_version: Integer,
    pub reward: RewardPolicy,
    pub maturity: MaturityPolicy,
    pub signature: SignaturePolicy,
}

impl ConsensusParams {
    /// Proof-of-work network with retargeting every 2016 blocks.
    pub fn proof_of_work(genesis_time: Natural, pow_limit_bits: Natural) -> Self {
        Self {
            variant: ConsensusVariant::ProofOfWork,
            genesis: genesis_header(genesis_time, pow_limit_bits),
            pow_limit_bits,
            no_retargeting: false,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            target_spacing: TARGET_TIME_PER_BLOCK,
            min_block_version: 1,
            reward: RewardPolicy::Halving { initial_subsidy: INITIAL_SUBSIDY, interval: HALVING_INTERVAL },
            maturity: MaturityPolicy::CoinbaseDepth(COINBASE_MATURITY),
            signature: SignaturePolicy::Script,
        }
    }

    /// Regression-test network: trivial target, no retargeting, fast halvings.
    pub fn regtest(genesis_time: Natural) -> Self {
        Self {
            no_retargeting: true,
            reward: RewardPolicy::Halving { initial_subsidy: INITIAL_SUBSIDY, interval: 150 },
            ..Self::proof_of_work(genesis_time, REGTEST_POW_LIMIT_BITS)
        }
    }

    /// Proof-of-authority network signed by `federation`.
    pub fn proof_of_authority(
        genesis_time: Natural,
        target_spacing: Natural,
        federation: Arc<dyn FederationProvider>,
        reward: Integer,
    ) -> Self {
        Self {
            variant: ConsensusVariant::ProofOfAuthority { target_spacing, federation },
            genesis: genesis_header(genesis_time, REGTEST_POW_LIMIT_BITS),
            pow_limit_bits: REGTEST_POW_LIMIT_BITS,
            no_retargeting: true,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            target_spacing,
            min_block_version: 1,
            reward: RewardPolicy::Fixed { reward },
            maturity: MaturityPolicy::CoinbaseDepth(COINBASE_MATURITY),
            signature: SignaturePolicy::Script,
        }
    }

    pub fn with_coinbase_maturity(mut self, depth: Natural) -> Self {
        self.maturity = MaturityPolicy::CoinbaseDepth(depth);
        self
    }

    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature = policy;
        self
    }

    pub fn genesis_hash(&self) -> Hash {
        crate::hashing::block_hash(&self.genesis)
    }

    pub fn is_proof_of_authority(&self) -> bool {
        matches!(self.variant, ConsensusVariant::ProofOfAuthority { .. })
    }
}

/// Genesis header: no transactions, so no coins.
pub fn genesis_header(timestamp: Natural, bits: Natural) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block_hash: [0u8; 32],
        merkle_root: [0u8; 32],
        timestamp,
        bits,
        nonce: 0,
        signature: None,
    }
}

/// Wall clock used for future-drift checks and mempool expiry.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide consensus state that is not chain state: parameters,
/// configuration and time.
#[derive(Clone)]
pub struct ConsensusContext {
    pub params: ConsensusParams,
    pub config: ConsensusConfig,
    pub clock: Arc<dyn Clock>,
}

impl ConsensusContext {
    pub fn new(params: ConsensusParams, config: ConsensusConfig, clock: Arc<dyn Clock>) -> Self {
        Self { params, config, clock }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }
}

impl fmt::Debug for ConsensusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusContext")
            .field("params", &self.params)
            .field("config", &self.config)
            .field("now", &self.clock.now())
            .finish()
    }
}
