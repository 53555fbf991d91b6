//! Minimal script interpreter
//!
//! Enough of the Bitcoin script language to spend pay-to-pubkey,
//! pay-to-pubkey-hash, hash-lock and bare `OP_TRUE` outputs. The rule
//! pipeline only sees it through [`SignaturePolicy`].

use crate::constants::*;
use crate::hashing::signature_hash;
use crate::types::*;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_TRUE: u8 = OP_1;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script exceeds the maximum size")]
    ScriptSize,
    #[error("push runs past the end of the script")]
    BadPush,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("stack underflow at opcode {0:#04x}")]
    StackUnderflow(u8),
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("opcode {0:#04x} is not supported")]
    UnsupportedOpcode(u8),
    #[error("verify failed at opcode {0:#04x}")]
    VerifyFailed(u8),
    #[error("signature check failed")]
    CheckSigFailed,
    #[error("final stack is empty or false")]
    EvalFalse,
}

/// A parsed script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Iterator over the instructions of a script
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
}

/// Parse `script` lazily into instructions.
pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, pos: 0 }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        let end = self.pos.checked_add(len).ok_or(ScriptError::BadPush)?;
        if end > self.script.len() {
            return Err(ScriptError::BadPush);
        }
        let data = &self.script[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    fn take_len(&mut self, width: usize) -> Result<usize, ScriptError> {
        let bytes = self.take(width)?;
        Ok(bytes.iter().rev().fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.pos)?;
        self.pos += 1;

        let result = match opcode {
            0x01..=0x4b => self.take(opcode as usize).map(Instruction::Push),
            OP_PUSHDATA1 => self.take_len(1).and_then(|len| self.take(len)).map(Instruction::Push),
            OP_PUSHDATA2 => self.take_len(2).and_then(|len| self.take(len)).map(Instruction::Push),
            OP_PUSHDATA4 => self.take_len(4).and_then(|len| self.take(len)).map(Instruction::Push),
            op => Ok(Instruction::Op(op)),
        };

        if result.is_err() {
            // stop after the first malformed push
            self.pos = self.script.len();
        }
        Some(result)
    }
}

/// Where the spending transaction is needed for signature checks
#[derive(Debug, Clone, Copy)]
pub struct SpendContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub script_code: &'a [u8],
}

/// CastToBool: any non-zero byte is true, except negative zero
pub fn cast_to_bool(item: &[u8]) -> bool {
    for (i, byte) in item.iter().enumerate() {
        if *byte != 0 {
            return !(i == item.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// EvalScript: run `script` on `stack`.
///
/// 1. Reject scripts over the size limit
/// 2. For each instruction: enforce the operation and stack limits, execute
/// 3. Any failing opcode aborts evaluation
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<ByteString>,
    spend: Option<&SpendContext<'_>>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut op_count = 0;
    for instruction in instructions(script) {
        match instruction? {
            Instruction::Push(data) => stack.push(data.to_vec()),
            Instruction::Op(opcode) => {
                if opcode > OP_16 {
                    op_count += 1;
                    if op_count > MAX_SCRIPT_OPS {
                        return Err(ScriptError::OpCount);
                    }
                }
                execute_opcode(opcode, stack, spend)?;
            }
        }

        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    Ok(())
}

fn pop(stack: &mut Vec<ByteString>, opcode: u8) -> Result<ByteString, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow(opcode))
}

fn execute_opcode(
    opcode: u8,
    stack: &mut Vec<ByteString>,
    spend: Option<&SpendContext<'_>>,
) -> Result<(), ScriptError> {
    match opcode {
        OP_0 => stack.push(Vec::new()),
        OP_1NEGATE => stack.push(vec![0x81]),
        OP_1..=OP_16 => stack.push(vec![opcode - (OP_1 - 1)]),
        OP_NOP => {}
        OP_VERIFY => {
            let top = pop(stack, opcode)?;
            if !cast_to_bool(&top) {
                return Err(ScriptError::VerifyFailed(opcode));
            }
        }
        OP_RETURN => return Err(ScriptError::OpReturn),
        OP_DROP => {
            pop(stack, opcode)?;
        }
        OP_DUP => {
            let top = stack.last().cloned().ok_or(ScriptError::StackUnderflow(opcode))?;
            stack.push(top);
        }
        OP_EQUAL | OP_EQUALVERIFY => {
            let a = pop(stack, opcode)?;
            let b = pop(stack, opcode)?;
            if opcode == OP_EQUALVERIFY {
                if a != b {
                    return Err(ScriptError::VerifyFailed(opcode));
                }
            } else {
                stack.push(if a == b { vec![1] } else { Vec::new() });
            }
        }
        OP_SHA256 => {
            let item = pop(stack, opcode)?;
            stack.push(Sha256::digest(&item).to_vec());
        }
        OP_HASH160 => {
            let item = pop(stack, opcode)?;
            stack.push(hash160(&item).to_vec());
        }
        OP_HASH256 => {
            let item = pop(stack, opcode)?;
            stack.push(crate::hashing::sha256d(&item).to_vec());
        }
        OP_CHECKSIG | OP_CHECKSIGVERIFY => {
            let pubkey = pop(stack, opcode)?;
            let signature = pop(stack, opcode)?;
            let valid = match spend {
                Some(spend) => check_signature(&signature, &pubkey, spend),
                None => false,
            };
            if opcode == OP_CHECKSIGVERIFY {
                if !valid {
                    return Err(ScriptError::CheckSigFailed);
                }
            } else {
                stack.push(if valid { vec![1] } else { Vec::new() });
            }
        }
        other => return Err(ScriptError::UnsupportedOpcode(other)),
    }
    Ok(())
}

/// VerifyScript: run the script sig, then the script pubkey on the resulting
/// stack; the top of the final stack must be true.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
) -> Result<(), ScriptError> {
    let spend = SpendContext { tx, input_index, script_code: script_pubkey };
    let mut stack = Vec::new();

    eval_script(script_sig, &mut stack, None)?;
    eval_script(script_pubkey, &mut stack, Some(&spend))?;

    match stack.last() {
        Some(top) if cast_to_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// ECDSA check of a DER signature with a trailing SIGHASH_ALL byte.
fn check_signature(signature: &[u8], pubkey: &[u8], spend: &SpendContext<'_>) -> bool {
    let (hash_type, der) = match signature.split_last() {
        Some(split) => split,
        None => return false,
    };
    if *hash_type != SIGHASH_ALL {
        return false;
    }

    let pubkey = match PublicKey::from_slice(pubkey) {
        Ok(pubkey) => pubkey,
        Err(_) => return false,
    };
    let mut signature = match Signature::from_der(der) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    signature.normalize_s();

    let digest = signature_hash(spend.tx, spend.input_index, spend.script_code);
    match Message::from_digest_slice(&digest) {
        Ok(message) => secp().verify_ecdsa(&message, &signature, &pubkey).is_ok(),
        Err(_) => false,
    }
}

/// RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Legacy signature-operation count: CHECKSIG counts one, CHECKMULTISIG twenty.
pub fn sigop_count(script: &[u8]) -> usize {
    let mut count = 0;
    for instruction in instructions(script) {
        match instruction {
            Ok(Instruction::Op(OP_CHECKSIG | OP_CHECKSIGVERIFY)) => count += 1,
            Ok(Instruction::Op(OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => count += 20,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    count
}

/// Provably unspendable output
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

/// Script contains only pushes (required of standard script sigs)
pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|instruction| match instruction {
        Ok(Instruction::Push(_)) => true,
        Ok(Instruction::Op(op)) => op <= OP_16,
        Err(_) => false,
    })
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2pk(script: &[u8]) -> bool {
    match script.len() {
        35 => script[0] == 33 && script[34] == OP_CHECKSIG,
        67 => script[0] == 65 && script[66] == OP_CHECKSIG,
        _ => false,
    }
}

/// Data carrier: OP_RETURN followed by pushes only, within the relay limit
pub fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) && script.len() <= MAX_OP_RETURN_RELAY && is_push_only(&script[1..])
}

/// Output templates relayed by default
pub fn is_standard_script(script: &[u8]) -> bool {
    is_p2pkh(script) || is_p2pk(script) || is_null_data(script)
}

/// Pay-to-pubkey-hash script for a public key
pub fn p2pkh_script(pubkey: &[u8]) -> ByteString {
    let mut script = vec![OP_DUP, OP_HASH160, 20];
    script.extend_from_slice(&hash160(pubkey));
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Script pushing `data` with the shortest push opcode
pub fn push_data(data: &[u8]) -> ByteString {
    let mut script = Vec::with_capacity(data.len() + 5);
    match data.len() {
        len @ 0..=0x4b => script.push(len as u8),
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
    script
}

/// How transaction inputs prove the right to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignaturePolicy {
    /// Evaluate script sig against the spent script pubkey.
    #[default]
    Script,
    /// Skip authorization entirely (test networks and trusted replays).
    AcceptAll,
}

impl SignaturePolicy {
    pub fn verify_input(&self, tx: &Transaction, input_index: usize, coin: &Coin) -> Result<(), ScriptError> {
        match self {
            SignaturePolicy::Script => {
                let input = &tx.inputs[input_index];
                verify_script(&input.script_sig, &coin.script_pubkey, tx, input_index)
            }
            SignaturePolicy::AcceptAll => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn spending_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([3; 32], 0),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value: 900, script_pubkey: vec![OP_TRUE] }],
            lock_time: 0,
        }
    }

    fn sign(tx: &Transaction, script_pubkey: &[u8], key: &SecretKey) -> ByteString {
        let secp = Secp256k1::new();
        let digest = signature_hash(tx, 0, script_pubkey);
        let message = Message::from_digest_slice(&digest).unwrap();
        let mut sig = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        sig
    }

    // ============================================================================
    // PARSING
    // ============================================================================

    #[test]
    fn test_instructions_parse_pushes() {
        let script = vec![0x02, 0xaa, 0xbb, OP_DUP, OP_PUSHDATA1, 0x01, 0xcc];
        let parsed: Vec<_> = instructions(&script).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            parsed,
            vec![Instruction::Push(&[0xaa, 0xbb]), Instruction::Op(OP_DUP), Instruction::Push(&[0xcc])]
        );
    }

    #[test]
    fn test_truncated_push_is_error() {
        let script = vec![0x05, 0x01];
        assert_eq!(instructions(&script).next(), Some(Err(ScriptError::BadPush)));
        assert_eq!(instructions(&script).count(), 1);
    }

    #[test]
    fn test_sigop_count() {
        assert_eq!(sigop_count(&[OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CHECKMULTISIG]), 22);
        // pushed bytes are data, not opcodes
        assert_eq!(sigop_count(&[0x01, OP_CHECKSIG]), 0);
    }

    // ============================================================================
    // EVALUATION
    // ============================================================================

    #[test]
    fn test_op_true_spends() {
        let tx = spending_tx();
        assert!(verify_script(&[], &[OP_TRUE], &tx, 0).is_ok());
        assert_eq!(verify_script(&[], &[OP_0], &tx, 0), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn test_op_return_fails() {
        let tx = spending_tx();
        assert_eq!(verify_script(&[], &[OP_RETURN], &tx, 0), Err(ScriptError::OpReturn));
    }

    #[test]
    fn test_hash_lock() {
        let preimage = b"secret".to_vec();
        let mut script_pubkey = vec![OP_SHA256];
        script_pubkey.extend(push_data(&Sha256::digest(&preimage)));
        script_pubkey.push(OP_EQUAL);

        let tx = spending_tx();
        assert!(verify_script(&push_data(&preimage), &script_pubkey, &tx, 0).is_ok());
        assert!(verify_script(&push_data(b"wrong"), &script_pubkey, &tx, 0).is_err());
    }

    #[test]
    fn test_negative_zero_is_false() {
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(!cast_to_bool(&[]));
    }

    #[test]
    fn test_p2pkh_signature() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key).serialize();
        let script_pubkey = p2pkh_script(&pubkey);

        let mut tx = spending_tx();
        let sig = sign(&tx, &script_pubkey, &key);
        let mut script_sig = push_data(&sig);
        script_sig.extend(push_data(&pubkey));
        tx.inputs[0].script_sig = script_sig;

        assert!(verify_script(&tx.inputs[0].script_sig, &script_pubkey, &tx, 0).is_ok());

        // any change to the signed transaction invalidates the signature
        let mut tampered = tx.clone();
        tampered.outputs[0].value += 1;
        assert!(verify_script(&tampered.inputs[0].script_sig, &script_pubkey, &tampered, 0).is_err());
    }

    #[test]
    fn test_accept_all_policy() {
        let tx = spending_tx();
        let coin = Coin { value: 1000, script_pubkey: vec![OP_0], height: 1, is_coinbase: false };
        assert!(SignaturePolicy::AcceptAll.verify_input(&tx, 0, &coin).is_ok());
        assert!(SignaturePolicy::Script.verify_input(&tx, 0, &coin).is_err());
    }

    // ============================================================================
    // STANDARDNESS
    // ============================================================================

    #[test]
    fn test_standard_templates() {
        assert!(is_standard_script(&p2pkh_script(&[2; 33])));
        assert!(is_standard_script(&[OP_RETURN, 0x02, 0xde, 0xad]));
        assert!(!is_standard_script(&[OP_TRUE]));
        assert!(!is_null_data(&[OP_RETURN, OP_DUP]));
        assert!(is_unspendable(&[OP_RETURN]));
        assert!(!is_unspendable(&[OP_TRUE]));
    }
}
