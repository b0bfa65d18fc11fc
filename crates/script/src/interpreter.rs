//! Script interpreter and validation.

use ripemd::{Digest as RipemdDigest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;
use tapd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_SCRIPT_SIZE, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use tapd_primitives::color::{split_colored_script, ColorIdentifier, COLOR_ID_SIZE};
use tapd_primitives::hash::{hash160, sha256, sha256d};
use tapd_primitives::transaction::Transaction;

use crate::opcodes::*;
use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, PrecomputedTxData, SighashType};
use crate::standard::is_push_only;

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 11;

/// Rules every block has enforced since genesis.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_NULLFAIL;
/// Policy-only rules. A failure caused solely by these is not a consensus violation.
pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: ScriptFlags =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;
pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
pub const MAX_STACK_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    PubkeyCount,
    SigCount,
    Verify,
    EqualVerify,
    CheckSigVerify,
    NumEqualVerify,
    BadOpcode,
    InvalidStackOperation,
    UnbalancedConditional,
    NegativeLockTime,
    UnsatisfiedLockTime,
    SigHashType,
    SigDer,
    MinimalData,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    CleanStack,
    SigNullFail,
    DiscourageUpgradableNops,
    InvalidColor,
    NumOverflow,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptError::EvalFalse => {
                "Script evaluated without error but finished with a false/empty top stack element"
            }
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "Script is too big",
            ScriptError::PushSize => "Push value size limit exceeded",
            ScriptError::OpCount => "Operation limit exceeded",
            ScriptError::StackSize => "Stack size limit exceeded",
            ScriptError::PubkeyCount => "Pubkey count negative or limit exceeded",
            ScriptError::SigCount => "Signature count negative or greater than pubkey count",
            ScriptError::Verify => "Script failed an OP_VERIFY operation",
            ScriptError::EqualVerify => "Script failed an OP_EQUALVERIFY operation",
            ScriptError::CheckSigVerify => "Script failed an OP_CHECKSIGVERIFY operation",
            ScriptError::NumEqualVerify => "Script failed an OP_NUMEQUALVERIFY operation",
            ScriptError::BadOpcode => "Opcode missing or not understood",
            ScriptError::InvalidStackOperation => "Operation not valid with the current stack size",
            ScriptError::UnbalancedConditional => "Invalid OP_IF construction",
            ScriptError::NegativeLockTime => "Negative locktime",
            ScriptError::UnsatisfiedLockTime => "Locktime requirement not satisfied",
            ScriptError::SigHashType => "Signature hash type missing or not understood",
            ScriptError::SigDer => "Non-canonical DER signature",
            ScriptError::MinimalData => "Data push larger than necessary",
            ScriptError::SigPushOnly => "Only non-push operators allowed in signatures",
            ScriptError::SigHighS => "Non-canonical signature: S value is unnecessarily high",
            ScriptError::SigNullDummy => "Dummy CHECKMULTISIG argument must be zero",
            ScriptError::PubkeyType => "Public key is neither compressed or uncompressed",
            ScriptError::CleanStack => "Extra items left on stack after execution",
            ScriptError::SigNullFail => {
                "Signature must be zero for failed CHECK(MULTI)SIG operation"
            }
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
            ScriptError::InvalidColor => "Invalid color identifier for OP_COLOR",
            ScriptError::NumOverflow => "Script number overflow",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ScriptError {}

/// Runs `script_sig` then `script_pubkey` (and the redeem script for P2SH or
/// colored P2SH outputs) for input `input_index` of `tx`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
    precomputed: Option<&PrecomputedTxData>,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
        precomputed,
    };

    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, &checker)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(script_pubkey, &mut stack, &checker)?;
    if !stack.last().is_some_and(|top| cast_to_bool(top)) {
        return Err(ScriptError::EvalFalse);
    }

    let (_, base_script) = split_colored_script(script_pubkey);
    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(base_script) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = pop(&mut stack)?;
        eval_script(&redeem_script, &mut stack, &checker)?;
        if !stack.last().is_some_and(|top| cast_to_bool(top)) {
            return Err(ScriptError::EvalFalse);
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    Ok(())
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
    precomputed: Option<&'a PrecomputedTxData>,
}

impl<'a> SignatureChecker<'a> {
    fn has(&self, flag: ScriptFlags) -> bool {
        self.flags & flag != 0
    }

    fn check_signature_encoding(&self, sig: &[u8]) -> Result<(), ScriptError> {
        if sig.is_empty() {
            return Ok(());
        }
        if self.has(SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC)
            && !is_valid_signature_encoding(sig)
        {
            return Err(ScriptError::SigDer);
        }
        if self.has(SCRIPT_VERIFY_LOW_S) {
            let der = &sig[..sig.len() - 1];
            let parsed = Signature::from_der_lax(der).map_err(|_| ScriptError::SigDer)?;
            let mut normalized = parsed;
            normalized.normalize_s();
            if normalized != parsed {
                return Err(ScriptError::SigHighS);
            }
        }
        if self.has(SCRIPT_VERIFY_STRICTENC) {
            let hash_type = SighashType(u32::from(sig[sig.len() - 1]));
            if !hash_type.is_defined() {
                return Err(ScriptError::SigHashType);
            }
        }
        Ok(())
    }

    fn check_pubkey_encoding(&self, pubkey: &[u8]) -> Result<(), ScriptError> {
        if self.has(SCRIPT_VERIFY_STRICTENC) && !is_valid_pubkey(pubkey) {
            return Err(ScriptError::PubkeyType);
        }
        Ok(())
    }

    fn check_sig(&self, sig_bytes: &[u8], pubkey_bytes: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = sig_bytes.split_last() else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return false;
        };
        let Ok(mut sig) = Signature::from_der_lax(der) else {
            return false;
        };
        sig.normalize_s();
        let Ok(sighash) = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            SighashType(u32::from(hash_type)),
            self.precomputed,
        ) else {
            return false;
        };
        secp256k1_verify()
            .verify_ecdsa(&Message::from_digest(sighash), &sig, &pubkey)
            .is_ok()
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        let threshold = i64::from(LOCKTIME_THRESHOLD);
        let tx_lock_time = i64::from(self.tx.lock_time);
        if (tx_lock_time < threshold) != (lock_time < threshold) {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if lock_time > tx_lock_time {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if self.tx.vin[self.input_index].sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        let tx_sequence = i64::from(self.tx.vin[self.input_index].sequence);
        if self.tx.features < 2 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if tx_sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        let mask = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK);
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        let type_flag = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG);
        if (tx_masked < type_flag) != (masked < type_flag) {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if masked > tx_masked {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }
}

fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let minimal = checker.has(SCRIPT_VERIFY_MINIMALDATA);
    let mut alt_stack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;
    let mut color_seen = false;
    let mut instructions = Instructions::new(script);

    while let Some(instruction) = instructions.next() {
        let (opcode, data) = instruction.ok_or(ScriptError::BadOpcode)?;
        let exec = exec_stack.iter().all(|branch| *branch);

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        if opcode <= OP_PUSHDATA4 {
            if exec {
                if minimal && !check_minimal_push(data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
        } else if exec || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = if opcode == OP_1NEGATE {
                        -1
                    } else {
                        i64::from(opcode - OP_1 + 1)
                    };
                    stack.push(script_num_to_vec(value));
                }
                OP_NOP => {}
                OP_IF | OP_NOTIF => {
                    let mut branch = false;
                    if exec {
                        branch = cast_to_bool(&pop(stack)?);
                        if opcode == OP_NOTIF {
                            branch = !branch;
                        }
                    }
                    exec_stack.push(branch);
                }
                OP_ELSE => {
                    let current = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *current = !*current;
                }
                OP_ENDIF => {
                    exec_stack
                        .pop()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(&pop(stack)?) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),
                OP_TOALTSTACK => alt_stack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let value = alt_stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(value);
                }
                OP_2DROP => {
                    pop(stack)?;
                    pop(stack)?;
                }
                OP_2DUP => {
                    let a = peek(stack, 2)?.to_vec();
                    let b = peek(stack, 1)?.to_vec();
                    stack.push(a);
                    stack.push(b);
                }
                OP_DEPTH => stack.push(script_num_to_vec(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let top = peek(stack, 1)?.to_vec();
                    stack.push(top);
                }
                OP_NIP => {
                    let top = pop(stack)?;
                    pop(stack)?;
                    stack.push(top);
                }
                OP_OVER => {
                    let second = peek(stack, 2)?.to_vec();
                    stack.push(second);
                }
                OP_SWAP => {
                    let len = stack.len();
                    if len < 2 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    stack.swap(len - 1, len - 2);
                }
                OP_SIZE => {
                    let len = peek(stack, 1)?.len();
                    stack.push(script_num_to_vec(len as i64));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let a = pop(stack)?;
                    let b = pop(stack)?;
                    if opcode == OP_EQUALVERIFY {
                        if a != b {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(a == b));
                    }
                }
                OP_1ADD | OP_1SUB | OP_NOT => {
                    let value = decode_script_num(&pop(stack)?, 4, minimal)?;
                    let result = match opcode {
                        OP_1ADD => value + 1,
                        OP_1SUB => value - 1,
                        _ => i64::from(value == 0),
                    };
                    stack.push(script_num_to_vec(result));
                }
                OP_ADD | OP_SUB | OP_NUMEQUAL | OP_NUMEQUALVERIFY | OP_LESSTHAN
                | OP_GREATERTHAN => {
                    let b = decode_script_num(&pop(stack)?, 4, minimal)?;
                    let a = decode_script_num(&pop(stack)?, 4, minimal)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                        OP_LESSTHAN => i64::from(a < b),
                        _ => i64::from(a > b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(script_num_to_vec(result));
                    }
                }
                OP_RIPEMD160 => {
                    let data = pop(stack)?;
                    stack.push(Ripemd160::digest(data).to_vec());
                }
                OP_SHA1 => {
                    let data = pop(stack)?;
                    stack.push(Sha1::digest(data).to_vec());
                }
                OP_SHA256 => {
                    let data = pop(stack)?;
                    stack.push(sha256(&data).to_vec());
                }
                OP_HASH160 => {
                    let data = pop(stack)?;
                    stack.push(hash160(&data).to_vec());
                }
                OP_HASH256 => {
                    let data = pop(stack)?;
                    stack.push(sha256d(&data).to_vec());
                }
                OP_CODESEPARATOR => code_start = instructions.position(),
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    checker.check_signature_encoding(&sig)?;
                    checker.check_pubkey_encoding(&pubkey)?;
                    let ok = checker.check_sig(&sig, &pubkey, &script[code_start..]);
                    if !ok && checker.has(SCRIPT_VERIFY_NULLFAIL) && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = check_multisig(stack, checker, &script[code_start..], &mut op_count)?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(ok));
                    }
                }
                OP_CHECKLOCKTIMEVERIFY => {
                    if checker.has(SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) {
                        let lock_time = decode_script_num(peek(stack, 1)?, 5, minimal)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLockTime);
                        }
                        checker.check_lock_time(lock_time)?;
                    } else if checker.has(SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if checker.has(SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) {
                        let sequence = decode_script_num(peek(stack, 1)?, 5, minimal)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLockTime);
                        }
                        if sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) == 0 {
                            checker.check_sequence(sequence)?;
                        }
                    } else if checker.has(SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if checker.has(SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_COLOR => {
                    let id = pop(stack)?;
                    if color_seen || id.len() != COLOR_ID_SIZE {
                        return Err(ScriptError::InvalidColor);
                    }
                    if !ColorIdentifier::from_bytes(&id).is_colored() {
                        return Err(ScriptError::InvalidColor);
                    }
                    color_seen = true;
                }
                _ => {
                    tapd_log::log_trace!("unknown opcode 0x{opcode:02x} at {}", instructions.position());
                    return Err(ScriptError::BadOpcode);
                }
            }
        }

        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn check_multisig(
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
    script_code: &[u8],
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let minimal = checker.has(SCRIPT_VERIFY_MINIMALDATA);
    let key_count = decode_script_num(&pop(stack)?, 4, minimal)?;
    if !(0..=MAX_PUBKEYS_PER_MULTISIG as i64).contains(&key_count) {
        return Err(ScriptError::PubkeyCount);
    }
    *op_count += key_count as usize;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    let mut pubkeys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        pubkeys.push(pop(stack)?);
    }
    pubkeys.reverse();

    let sig_count = decode_script_num(&pop(stack)?, 4, minimal)?;
    if sig_count < 0 || sig_count > key_count {
        return Err(ScriptError::SigCount);
    }
    let mut sigs = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        sigs.push(pop(stack)?);
    }
    sigs.reverse();

    let dummy = pop(stack)?;
    if checker.has(SCRIPT_VERIFY_NULLDUMMY) && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }

    let mut sig_index = 0usize;
    let mut key_index = 0usize;
    let mut success = true;
    while success && sig_index < sigs.len() {
        let sig = &sigs[sig_index];
        let key = &pubkeys[key_index];
        checker.check_signature_encoding(sig)?;
        checker.check_pubkey_encoding(key)?;
        if checker.check_sig(sig, key, script_code) {
            sig_index += 1;
        }
        key_index += 1;
        if sigs.len() - sig_index > pubkeys.len() - key_index {
            success = false;
        }
    }

    if !success && checker.has(SCRIPT_VERIFY_NULLFAIL) && sigs.iter().any(|sig| !sig.is_empty()) {
        return Err(ScriptError::SigNullFail);
    }
    Ok(success)
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

/// `depth` 1 is the top element.
fn peek(stack: &[Vec<u8>], depth: usize) -> Result<&[u8], ScriptError> {
    stack
        .len()
        .checked_sub(depth)
        .map(|index| stack[index].as_slice())
        .ok_or(ScriptError::InvalidStackOperation)
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

pub(crate) fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn decode_script_num(data: &[u8], max_len: usize, require_minimal: bool) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    if require_minimal {
        if let Some(&last) = data.last() {
            if last & 0x7f == 0 && (data.len() == 1 || data[data.len() - 2] & 0x80 == 0) {
                return Err(ScriptError::MinimalData);
            }
        }
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= i64::from(*byte) << (8 * i);
    }
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (data.len() - 1)));
        result = -result;
    }
    Ok(result)
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if *last & 0x80 != 0 {
            result.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    result
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

/// Strict DER plus trailing hash type byte, as required by BIP66.
fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data.len() {
        0 => opcode == OP_0,
        1 if (1..=16).contains(&data[0]) => opcode == OP_1 + (data[0] - 1),
        1 if data[0] == 0x81 => opcode == OP_1NEGATE,
        len if len <= 75 => opcode as usize == len,
        len if len <= 255 => opcode == OP_PUSHDATA1,
        len if len <= 65535 => opcode == OP_PUSHDATA2,
        _ => true,
    }
}
