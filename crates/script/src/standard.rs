//! Standard script classification utilities.

use tapd_primitives::color::{split_colored_script, ColorIdentifier};

use crate::interpreter::MAX_PUBKEYS_PER_MULTISIG;
use crate::opcodes::*;

/// Largest null-data output script relayed by default (OP_RETURN + 80 bytes + push overhead).
pub const MAX_OP_RETURN_RELAY: usize = 83;
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    MultiSig { required: u8, keys: u8 },
    NullData,
    ColoredP2Pkh,
    ColoredP2Sh,
    NonStandard,
}

impl ScriptType {
    pub fn is_standard(self) -> bool {
        !matches!(self, ScriptType::NonStandard)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::P2Pk => "pubkey",
            ScriptType::P2Pkh => "pubkeyhash",
            ScriptType::P2Sh => "scripthash",
            ScriptType::MultiSig { .. } => "multisig",
            ScriptType::NullData => "nulldata",
            ScriptType::ColoredP2Pkh => "coloredpubkeyhash",
            ScriptType::ColoredP2Sh => "coloredscripthash",
            ScriptType::NonStandard => "nonstandard",
        }
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    let (color, base) = split_colored_script(script);
    if !matches!(color, ColorIdentifier::None) {
        if !color.is_colored() {
            return ScriptType::NonStandard;
        }
        return if is_p2pkh(base) {
            ScriptType::ColoredP2Pkh
        } else if is_p2sh(base) {
            ScriptType::ColoredP2Sh
        } else {
            ScriptType::NonStandard
        };
    }

    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if let Some((required, keys)) = match_multisig(script) {
        ScriptType::MultiSig { required, keys }
    } else {
        ScriptType::NonStandard
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    crate::interpreter::is_p2sh(script)
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
        && script.len() <= MAX_OP_RETURN_RELAY
        && is_push_only(&script[1..])
}

fn small_int(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

/// `m <key>... n OP_CHECKMULTISIG` with 1 <= m <= n.
fn match_multisig(script: &[u8]) -> Option<(u8, u8)> {
    if script.last() != Some(&OP_CHECKMULTISIG) {
        return None;
    }
    let mut instructions = Instructions::new(&script[..script.len() - 1]);
    let (first, _) = instructions.next()??;
    let required = small_int(first)?;
    let mut keys = 0u8;
    for instruction in instructions {
        let (opcode, data) = instruction?;
        if opcode <= OP_PUSHDATA4 {
            if data.len() != 33 && data.len() != 65 {
                return None;
            }
            keys = keys.checked_add(1)?;
        } else {
            let declared = small_int(opcode)?;
            if declared != keys || required == 0 || required > keys {
                return None;
            }
            return Some((required, keys));
        }
    }
    None
}

pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|instruction| match instruction {
        Some((opcode, _)) => opcode <= OP_16,
        None => false,
    })
}

pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || script.len() > tapd_consensus::constants::MAX_SCRIPT_SIZE
}

/// Legacy sigop count. With `accurate`, multisig counts the declared key count
/// when it directly precedes the opcode.
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = None;
    for instruction in Instructions::new(script) {
        let Some((opcode, _)) = instruction else {
            break;
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode.and_then(small_int) {
                    Some(keys) if accurate && keys > 0 => u32::from(keys),
                    _ => MAX_PUBKEYS_PER_MULTISIG as u32,
                };
            }
            _ => {}
        }
        last_opcode = Some(opcode);
    }
    count
}

/// Sigops of the redeem script pushed last by `script_sig`, for P2SH outputs
/// (colored or not).
pub fn p2sh_sigops(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    let (_, base) = split_colored_script(script_pubkey);
    if !is_p2sh(base) {
        return count_sigops(script_pubkey, true);
    }
    let mut redeem_script: &[u8] = &[];
    for instruction in Instructions::new(script_sig) {
        match instruction {
            Some((opcode, data)) if opcode <= OP_16 => redeem_script = data,
            _ => return 0,
        }
    }
    count_sigops(redeem_script, true)
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        len if len < OP_PUSHDATA1 as usize => script.push(len as u8),
        len if len <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len if len <= 0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn multisig_script(required: u8, pubkeys: &[&[u8]]) -> Vec<u8> {
    let mut script = vec![OP_1 + required.saturating_sub(1)];
    for key in pubkeys {
        push_data(&mut script, key);
    }
    script.push(OP_1 + (pubkeys.len() as u8).saturating_sub(1));
    script.push(OP_CHECKMULTISIG);
    script
}

pub fn null_data_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    push_data(&mut script, payload);
    script
}
