//! Header rules: version, timestamps, target and (proof-of-authority) signer

use super::{ConsensusRule, RuleContext};
use crate::context::FederationProvider;
use crate::error::{ConsensusError, RuleError};
use crate::pow::{check_proof_of_work, next_work_required};
use crate::types::*;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use std::sync::Arc;

/// Version must not be below the network minimum.
pub struct HeaderVersionRule;

impl ConsensusRule for HeaderVersionRule {
    fn name(&self) -> &'static str {
        "HeaderVersionRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let version = ctx.header.header.version;
        if version < ctx.consensus.params.min_block_version {
            return Err(ConsensusError::BadVersion(version).into());
        }
        Ok(())
    }
}

/// Timestamp after the parent's median time past and not too far ahead of
/// the local clock.
pub struct HeaderTimeRule;

impl ConsensusRule for HeaderTimeRule {
    fn name(&self) -> &'static str {
        "HeaderTimeRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let parent = ctx.parent()?;
        let time = ctx.header.header.timestamp;

        let median_time_past = ctx.index.median_time_past(&parent.hash);
        if time <= median_time_past {
            return Err(ConsensusError::TimeTooOld { time, median_time_past }.into());
        }

        let limit = ctx.consensus.now() + ctx.consensus.config.max_future_drift_secs;
        if time > limit {
            return Err(ConsensusError::TimeTooNew { time, limit }.into());
        }
        Ok(())
    }
}

/// Bits match the retarget schedule and the hash meets them.
pub struct CheckDifficultyRule;

impl ConsensusRule for CheckDifficultyRule {
    fn name(&self) -> &'static str {
        "CheckDifficultyRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let params = &ctx.consensus.params;
        let parent = ctx.parent()?;
        let header = &ctx.header.header;

        let expected = next_work_required(ctx.index, parent, params);
        if header.bits != expected {
            return Err(ConsensusError::BadDiffBits { expected, actual: header.bits }.into());
        }
        if !check_proof_of_work(&ctx.header.hash, header.bits, params.pow_limit_bits) {
            return Err(ConsensusError::HighHash.into());
        }
        Ok(())
    }
}

/// Proof-of-authority blocks carry the network's constant target.
pub struct FixedTargetRule;

impl ConsensusRule for FixedTargetRule {
    fn name(&self) -> &'static str {
        "FixedTargetRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let expected = ctx.consensus.params.pow_limit_bits;
        let actual = ctx.header.header.bits;
        if actual != expected {
            return Err(ConsensusError::BadDiffBits { expected, actual }.into());
        }
        Ok(())
    }
}

/// Timestamps fall on slot boundaries.
pub struct PoaTimestampSlotRule {
    target_spacing: Natural,
}

impl PoaTimestampSlotRule {
    pub fn new(target_spacing: Natural) -> Self {
        Self { target_spacing }
    }
}

impl ConsensusRule for PoaTimestampSlotRule {
    fn name(&self) -> &'static str {
        "PoaTimestampSlotRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let time = ctx.header.header.timestamp;
        if self.target_spacing == 0 || time % self.target_spacing != 0 {
            return Err(ConsensusError::BadTimestampSlot { time, spacing: self.target_spacing }.into());
        }
        Ok(())
    }
}

/// The header signature was made by a federation member.
///
/// Defers when the membership for the height is not known yet.
pub struct FederationSignatureRule {
    federation: Arc<dyn FederationProvider>,
}

impl FederationSignatureRule {
    pub fn new(federation: Arc<dyn FederationProvider>) -> Self {
        Self { federation }
    }
}

impl ConsensusRule for FederationSignatureRule {
    fn name(&self) -> &'static str {
        "FederationSignatureRule"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        let height = ctx.header.height;
        let members = self
            .federation
            .federation_at(height)
            .ok_or_else(|| RuleError::Deferred(format!("federation for height {height} is unknown")))?;

        let signature = ctx
            .header
            .header
            .signature
            .as_deref()
            .ok_or_else(|| ConsensusError::BadBlockSignature("header is not signed".to_string()))?;

        if !verify_header_signature(&ctx.header.hash, signature, &members) {
            return Err(ConsensusError::BadBlockSignature("no federation member signed this header".to_string()).into());
        }
        Ok(())
    }
}

/// DER signature over the block hash by one of `members`
pub fn verify_header_signature(hash: &Hash, signature: &[u8], members: &[PublicKey]) -> bool {
    let mut signature = match Signature::from_der(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    signature.normalize_s();
    let message = match Message::from_digest_slice(hash) {
        Ok(message) => message,
        Err(_) => return false,
    };

    let secp = Secp256k1::verification_only();
    members.iter().any(|member| secp.verify_ecdsa(&message, &signature, member).is_ok())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::chain_index::ChainIndex;
    use crate::config::ConsensusConfig;
    use crate::constants::*;
    use crate::context::{ConsensusContext, ConsensusParams, ManualClock, StaticFederation};
    use secp256k1::SecretKey;

    fn run(rule: &dyn ConsensusRule, consensus: &ConsensusContext, index: &ChainIndex, header: BlockHeader) -> Result<(), RuleError> {
        let node = index.prepare(header).unwrap();
        let mut ctx = RuleContext::new(consensus, index, &node);
        rule.run(&mut ctx)
    }

    fn next_header(index: &ChainIndex) -> BlockHeader {
        block_on(index.tip(), vec![coinbase(1, 1)]).header
    }

    // ============================================================================
    // PROOF OF WORK HEADERS
    // ============================================================================

    #[test]
    fn test_version_rule() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut header = next_header(&index);
        assert!(run(&HeaderVersionRule, &consensus, &index, header.clone()).is_ok());
        header.version = 0;
        assert_eq!(
            run(&HeaderVersionRule, &consensus, &index, header),
            Err(RuleError::Consensus(ConsensusError::BadVersion(0)))
        );
    }

    #[test]
    fn test_time_rule_bounds() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut header = next_header(&index);

        header.timestamp = GENESIS_TIME;
        assert!(matches!(
            run(&HeaderTimeRule, &consensus, &index, header.clone()),
            Err(RuleError::Consensus(ConsensusError::TimeTooOld { .. }))
        ));

        let now = consensus.now();
        header.timestamp = now + DEFAULT_MAX_FUTURE_DRIFT_SECS;
        assert!(run(&HeaderTimeRule, &consensus, &index, header.clone()).is_ok());

        header.timestamp = now + DEFAULT_MAX_FUTURE_DRIFT_SECS + 1;
        let err = run(&HeaderTimeRule, &consensus, &index, header).unwrap_err();
        match err {
            RuleError::Consensus(err) => assert_eq!(err.code(), "time-too-new"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_difficulty_rule() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());

        let mut block = block_on(index.tip(), vec![coinbase(1, 1)]);
        mine(&mut block);
        assert!(run(&CheckDifficultyRule, &consensus, &index, block.header.clone()).is_ok());

        block.header.bits = POW_LIMIT_BITS;
        assert!(matches!(
            run(&CheckDifficultyRule, &consensus, &index, block.header),
            Err(RuleError::Consensus(ConsensusError::BadDiffBits { .. }))
        ));
    }

    #[test]
    fn test_high_hash_rejected() {
        let consensus = regtest_context();
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut header = next_header(&index);

        // find a nonce whose hash misses the regtest target
        while check_proof_of_work(&crate::hashing::block_hash(&header), header.bits, REGTEST_POW_LIMIT_BITS) {
            header.nonce += 1;
        }
        assert_eq!(
            run(&CheckDifficultyRule, &consensus, &index, header),
            Err(RuleError::Consensus(ConsensusError::HighHash))
        );
    }

    // ============================================================================
    // PROOF OF AUTHORITY HEADERS
    // ============================================================================

    struct UnknownFederation;

    impl FederationProvider for UnknownFederation {
        fn federation_at(&self, _height: Natural) -> Option<Vec<PublicKey>> {
            None
        }
    }

    fn poa_context(federation: Arc<dyn FederationProvider>) -> ConsensusContext {
        ConsensusContext::new(
            ConsensusParams::proof_of_authority(GENESIS_TIME, 16, federation, 50 * COIN),
            ConsensusConfig::default(),
            Arc::new(ManualClock::new(GENESIS_TIME + 10_000)),
        )
    }

    fn sign_header(header: &mut BlockHeader, key: &SecretKey) {
        let secp = Secp256k1::new();
        let hash = crate::hashing::block_hash(header);
        let message = Message::from_digest_slice(&hash).unwrap();
        header.signature = Some(secp.sign_ecdsa(&message, key).serialize_der().to_vec());
    }

    #[test]
    fn test_federation_signature() {
        let secp = Secp256k1::new();
        let member = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let outsider = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let federation = Arc::new(StaticFederation::new(vec![PublicKey::from_secret_key(&secp, &member)]));
        let consensus = poa_context(federation.clone());
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let rule = FederationSignatureRule::new(federation);

        let mut header = next_header(&index);
        assert!(matches!(
            run(&rule, &consensus, &index, header.clone()),
            Err(RuleError::Consensus(ConsensusError::BadBlockSignature(_)))
        ));

        sign_header(&mut header, &outsider);
        assert!(run(&rule, &consensus, &index, header.clone()).is_err());

        sign_header(&mut header, &member);
        assert!(run(&rule, &consensus, &index, header).is_ok());
    }

    #[test]
    fn test_unknown_federation_defers() {
        let consensus = poa_context(Arc::new(UnknownFederation));
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let rule = FederationSignatureRule::new(Arc::new(UnknownFederation));
        assert!(matches!(run(&rule, &consensus, &index, next_header(&index)), Err(RuleError::Deferred(_))));
    }

    #[test]
    fn test_slot_and_fixed_target() {
        let consensus = poa_context(Arc::new(UnknownFederation));
        let index = ChainIndex::new(consensus.params.genesis.clone());
        let mut header = next_header(&index);

        header.timestamp = GENESIS_TIME + 32;
        assert!(run(&PoaTimestampSlotRule::new(16), &consensus, &index, header.clone()).is_ok());
        header.timestamp += 1;
        assert!(run(&PoaTimestampSlotRule::new(16), &consensus, &index, header.clone()).is_err());

        assert!(run(&FixedTargetRule, &consensus, &index, header.clone()).is_ok());
        header.bits = POW_LIMIT_BITS;
        assert!(run(&FixedTargetRule, &consensus, &index, header).is_err());
    }
}
